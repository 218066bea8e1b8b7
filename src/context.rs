//! Supervisor context: the shutdown token plus the registry of output
//! reader tasks, passed to everything that spawns.

use crate::streams::{self, LineSink, StreamName};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TrackedReader {
    owner: u32,
    stream: StreamName,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// How a batch of reader joins went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinSummary {
    pub joined: usize,
    pub abandoned: usize,
}

pub struct SupervisorContext {
    shutdown: CancellationToken,
    readers: Mutex<Vec<TrackedReader>>,
}

impl SupervisorContext {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled when the operator asks the supervisor to exit.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn a reader for one stream of workload `owner` and track it.
    pub fn spawn_reader<R>(
        &self,
        owner: u32,
        stream: StreamName,
        source: R,
        stop: CancellationToken,
        sink: LineSink,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(streams::drain_lines(source, stream, stop.clone(), sink));
        self.lock().push(TrackedReader {
            owner,
            stream,
            stop,
            handle,
        });
    }

    /// Readers that have not finished yet.
    pub fn active_readers(&self) -> usize {
        self.lock().iter().filter(|r| !r.handle.is_finished()).count()
    }

    /// Drop registry entries whose task already finished.
    pub fn prune_finished(&self) -> usize {
        let mut readers = self.lock();
        let before = readers.len();
        readers.retain(|r| !r.handle.is_finished());
        before - readers.len()
    }

    /// Join the readers of `owner` (or all readers when `None`), waiting at
    /// most `budget` for each to reach end-of-stream. A reader that misses its
    /// budget is cancelled and detached.
    pub async fn join_readers(&self, owner: Option<u32>, budget: Duration) -> JoinSummary {
        let taken: Vec<TrackedReader> = {
            let mut readers = self.lock();
            let (taken, kept): (Vec<_>, Vec<_>) = readers
                .drain(..)
                .partition(|r| owner.map_or(true, |o| r.owner == o));
            *readers = kept;
            taken
        };

        let mut summary = JoinSummary::default();
        for mut reader in taken {
            match tokio::time::timeout(budget, &mut reader.handle).await {
                Ok(_) => summary.joined += 1,
                Err(_) => {
                    reader.stop.cancel();
                    tracing::warn!(
                        pid = reader.owner,
                        stream = reader.stream.as_str(),
                        "output reader did not stop in time, abandoning it"
                    );
                    summary.abandoned += 1;
                }
            }
        }
        summary
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TrackedReader>> {
        self.readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SupervisorContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::test_support::Collector;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_join_readers_only_touches_owner() {
        let ctx = SupervisorContext::new();
        let collector = Collector::default();
        let stop_a = CancellationToken::new();
        let stop_b = CancellationToken::new();
        let (_wa, ra) = tokio::io::duplex(16);
        let (_wb, rb) = tokio::io::duplex(16);

        ctx.spawn_reader(1, StreamName::Stdout, ra, stop_a.clone(), collector.sink());
        ctx.spawn_reader(2, StreamName::Stdout, rb, stop_b.clone(), collector.sink());
        assert_eq!(ctx.active_readers(), 2);

        stop_a.cancel();
        let summary = ctx.join_readers(Some(1), Duration::from_secs(2)).await;
        assert_eq!(summary, JoinSummary { joined: 1, abandoned: 0 });
        assert_eq!(ctx.active_readers(), 1);

        stop_b.cancel();
        let summary = ctx.join_readers(None, Duration::from_secs(2)).await;
        assert_eq!(summary.joined, 1);
        assert_eq!(ctx.active_readers(), 0);
    }

    #[tokio::test]
    async fn test_reader_that_never_stops_is_abandoned() {
        let ctx = SupervisorContext::new();
        let (_writer, reader) = tokio::io::duplex(16);
        let stop = CancellationToken::new();

        // The writer stays open: the reader cannot reach end-of-stream.
        ctx.spawn_reader(
            7,
            StreamName::Stderr,
            reader,
            stop.clone(),
            Collector::default().sink(),
        );

        let started = std::time::Instant::now();
        let summary = ctx.join_readers(Some(7), Duration::from_millis(100)).await;
        assert_eq!(summary, JoinSummary { joined: 0, abandoned: 1 });
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(stop.is_cancelled());
        assert_eq!(ctx.active_readers(), 0);
    }

    #[tokio::test]
    async fn test_join_lets_reader_drain_buffered_lines() {
        let ctx = SupervisorContext::new();
        let collector = Collector::default();
        let (mut writer, reader) = tokio::io::duplex(64);
        let stop = CancellationToken::new();
        ctx.spawn_reader(4, StreamName::Stdout, reader, stop.clone(), collector.sink());

        writer.write_all(b"last words\n").await.unwrap();
        drop(writer);

        let summary = ctx.join_readers(Some(4), Duration::from_secs(2)).await;
        assert_eq!(summary, JoinSummary { joined: 1, abandoned: 0 });
        assert!(!stop.is_cancelled());
        assert_eq!(collector.texts(StreamName::Stdout), vec!["last words"]);
    }

    #[tokio::test]
    async fn test_prune_finished_removes_completed_readers() {
        let ctx = SupervisorContext::new();
        let collector = Collector::default();
        let (mut writer, reader) = tokio::io::duplex(16);
        ctx.spawn_reader(
            3,
            StreamName::Stdout,
            reader,
            CancellationToken::new(),
            collector.sink(),
        );

        writer.write_all(b"done\n").await.unwrap();
        drop(writer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(ctx.active_readers(), 0);
        assert_eq!(ctx.prune_finished(), 1);
        assert_eq!(collector.texts(StreamName::Stdout), vec!["done"]);
    }
}
