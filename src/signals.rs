//! Signal handling for graceful shutdown.
//!
//! SIGINT (Ctrl-C) and SIGTERM both cancel the supervisor's shutdown token.
//! The polling loop notices at its next await point and runs the workload
//! shutdown protocol before returning.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub struct SignalHandler {
    shutdown: CancellationToken,
}

impl SignalHandler {
    /// Register SIGINT and SIGTERM listeners and spawn the watcher task.
    pub fn install(shutdown: CancellationToken) -> std::io::Result<Self> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let token = shutdown.clone();

        tokio::spawn(async move {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = token.cancelled() => return,
            };
            tracing::info!(signal = name, "shutdown requested, stopping workload");
            token.cancel();
        });

        Ok(Self { shutdown })
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
