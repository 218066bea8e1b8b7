//! The polling loop: keep one workload running, restart it on crash, and
//! replace it whenever the tracked branch advances.

use crate::clock::LoopCounters;
use crate::config::Timing;
use crate::context::SupervisorContext;
use crate::diagnostics;
use crate::git::{GitRepo, StashCleanup, UpdateOutcome};
use crate::retry::{retry_until_ok, RetryPolicy};
use crate::status::{StatusTracker, SupervisorState};
use crate::streams::{self, LineSink};
use crate::workload::{Workload, WorkloadSpec};

/// Where updates come from. Implemented by [`GitRepo`].
pub trait Upstream {
    /// Whether the remote branch moved past the local checkout.
    async fn check_for_updates(&self) -> bool;
    /// Bring the working copy up to date.
    async fn pull_updates(&self) -> UpdateOutcome;
    /// Periodic stash maintenance.
    async fn cleanup_stashes(&self) -> StashCleanup;
}

impl Upstream for GitRepo {
    async fn check_for_updates(&self) -> bool {
        GitRepo::check_for_updates(self).await
    }

    async fn pull_updates(&self) -> UpdateOutcome {
        GitRepo::pull_updates(self).await
    }

    async fn cleanup_stashes(&self) -> StashCleanup {
        GitRepo::cleanup_stashes(self).await
    }
}

/// Loop parameters resolved from config.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub timing: Timing,
    pub diagnostics_every: u32,
    pub stash_cleanup_every: u32,
    pub container: bool,
}

/// What a single polling iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Workload running, nothing upstream.
    Healthy,
    /// Workload had exited and was started again.
    Restarted,
    /// Upstream advanced; the workload was stopped, updated and started again.
    Updated(UpdateOutcome),
    /// Shutdown was requested.
    Cancelled,
}

pub struct Supervisor<U> {
    upstream: U,
    spec: WorkloadSpec,
    ctx: SupervisorContext,
    sink: LineSink,
    settings: Settings,
    counters: LoopCounters,
    launch_retry: RetryPolicy,
    status: StatusTracker,
    workload: Option<Workload>,
}

impl<U: Upstream> Supervisor<U> {
    pub fn new(upstream: U, spec: WorkloadSpec, ctx: SupervisorContext, settings: Settings) -> Self {
        Self {
            upstream,
            spec,
            ctx,
            sink: streams::log_sink(),
            counters: LoopCounters::new(settings.diagnostics_every, settings.stash_cleanup_every),
            launch_retry: RetryPolicy::new(settings.timing.launch_retry),
            status: StatusTracker::new(None, "", std::path::Path::new("")),
            settings,
            workload: None,
        }
    }

    pub fn with_sink(mut self, sink: LineSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_status(mut self, status: StatusTracker) -> Self {
        self.status = status;
        self
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.ctx
    }

    pub fn workload_pid(&self) -> Option<u32> {
        self.workload.as_ref().map(Workload::pid)
    }

    /// Launch the workload, retrying every `launch_retry` until it starts.
    ///
    /// Returns `false` only if shutdown was requested first.
    pub async fn start(&mut self) -> bool {
        let spec = &self.spec;
        let ctx = &self.ctx;
        let sink = &self.sink;
        let status = &self.status;

        let started = retry_until_ok(&mut self.launch_retry, ctx.shutdown(), || {
            let result = Workload::start(spec, ctx, sink);
            if result.is_err() {
                status.update(SupervisorState::RetryingLaunch);
            }
            result
        })
        .await;

        match started {
            Some(workload) => {
                self.status.set_workload_pid(Some(workload.pid()));
                self.status.update(SupervisorState::Running);
                self.workload = Some(workload);
                true
            }
            None => false,
        }
    }

    /// Stop the current workload, if any, with the full shutdown protocol.
    async fn stop_workload(&mut self) {
        if let Some(workload) = self.workload.take() {
            let timing = self.settings.timing;
            workload
                .stop(timing.graceful_stop, timing.reader_join, &self.ctx)
                .await;
        }
        self.status.set_workload_pid(None);
    }

    /// One polling iteration (without the trailing sleep).
    pub async fn poll_once(&mut self) -> PollOutcome {
        if self.ctx.is_shutting_down() {
            return PollOutcome::Cancelled;
        }

        let due = self.counters.tick(self.settings.container);
        if due.diagnostics {
            diagnostics::log_usage(&self.ctx, self.workload_pid());
        }
        if due.stash_cleanup {
            let result = self.upstream.cleanup_stashes().await;
            tracing::debug!(?result, "stash maintenance finished");
        }

        if self.upstream.check_for_updates().await {
            tracing::info!("new changes detected, updating");
            self.status.update(SupervisorState::Updating);
            self.stop_workload().await;
            let outcome = self.upstream.pull_updates().await;
            self.status.record_update();

            tracing::info!(?outcome, "starting the workload");
            if !self.start().await {
                return PollOutcome::Cancelled;
            }
            let pruned = self.ctx.prune_finished();
            tracing::debug!(pruned, "pruned finished output readers");
            diagnostics::log_usage(&self.ctx, self.workload_pid());
            return PollOutcome::Updated(outcome);
        }

        let running = match self.workload.as_mut() {
            Some(workload) => workload.is_running(),
            None => false,
        };
        if running {
            return PollOutcome::Healthy;
        }

        if let Some(workload) = &self.workload {
            tracing::warn!(
                pid = workload.pid(),
                status = ?workload.exit_status(),
                uptime_secs = workload.uptime().as_secs(),
                "workload exited, restarting"
            );
        }
        self.status.update(SupervisorState::Restarting);
        self.status.record_restart();
        // Reaps leftover group members and joins the old readers.
        self.stop_workload().await;

        if !self.start().await {
            return PollOutcome::Cancelled;
        }
        PollOutcome::Restarted
    }

    /// Start the workload and poll until shutdown is requested, then stop it.
    pub async fn run(mut self) {
        self.status.update(SupervisorState::Starting);

        if self.start().await {
            loop {
                if self.poll_once().await == PollOutcome::Cancelled {
                    break;
                }
                tokio::select! {
                    _ = self.ctx.shutdown().cancelled() => break,
                    _ = tokio::time::sleep(self.settings.timing.poll_interval) => {}
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop the workload and join any remaining readers.
    pub async fn shutdown(&mut self) {
        tracing::info!("exiting, stopping workload");
        self.status.update(SupervisorState::ShuttingDown);
        self.stop_workload().await;

        let summary = self
            .ctx
            .join_readers(None, self.settings.timing.reader_join)
            .await;
        if summary.abandoned > 0 {
            tracing::warn!(abandoned = summary.abandoned, "abandoned output readers at exit");
        }
        self.status.remove();
        tracing::info!(
            restarts = self.status.restarts(),
            updates = self.status.updates(),
            "supervisor stopped"
        );
    }
}
