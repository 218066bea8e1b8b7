//! The supervised workload: one shell command running in its own process
//! group, with both output streams drained into the log sink.

use crate::context::{JoinSummary, SupervisorContext};
use crate::environment::ChildEnv;
use crate::streams::{LineSink, StreamName};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// How long `stop` waits for SIGKILLed group members to disappear.
const GROUP_EXIT_WAIT: Duration = Duration::from_secs(2);
const GROUP_POLL: Duration = Duration::from_millis(50);

/// How to launch the workload: `<shell> -c <command>` in `workdir`.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub shell: PathBuf,
    pub command: String,
    pub workdir: PathBuf,
    pub env: ChildEnv,
}

/// Errors that can occur while launching the workload.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("failed to spawn workload `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("workload `{command}` exited before its pid could be read")]
    NoPid { command: String },
}

/// What happened while stopping a workload.
#[derive(Debug)]
pub struct StopReport {
    pub pid: u32,
    /// Exit status of the group leader, if it could be reaped.
    pub status: Option<ExitStatus>,
    /// Whether SIGKILL was needed after the graceful window.
    pub forced: bool,
    /// Whether the process group was confirmed empty before the readers
    /// were joined.
    pub group_cleared: bool,
    pub readers: JoinSummary,
    pub elapsed: Duration,
}

/// A running workload instance.
///
/// The child is spawned with `process_group(0)`, so its pid is also the
/// process-group id every signal is delivered to.
pub struct Workload {
    child: Child,
    pid: u32,
    started: Instant,
    exit: Option<ExitStatus>,
}

impl Workload {
    /// Spawn the workload and start draining its output.
    pub fn start(
        spec: &WorkloadSpec,
        ctx: &SupervisorContext,
        sink: &LineSink,
    ) -> Result<Self, WorkloadError> {
        tracing::info!(command = %spec.command, workdir = %spec.workdir.display(), "starting workload");

        let mut child = Command::new(&spec.shell)
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| WorkloadError::Spawn {
                command: spec.command.clone(),
                source: e,
            })?;

        let Some(pid) = child.id() else {
            return Err(WorkloadError::NoPid {
                command: spec.command.clone(),
            });
        };

        let readers_stop = CancellationToken::new();
        if let Some(stdout) = child.stdout.take() {
            ctx.spawn_reader(
                pid,
                StreamName::Stdout,
                stdout,
                readers_stop.clone(),
                sink.clone(),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            ctx.spawn_reader(
                pid,
                StreamName::Stderr,
                stderr,
                readers_stop.clone(),
                sink.clone(),
            );
        }

        tracing::info!(pid, "workload started");
        Ok(Self {
            child,
            pid,
            started: Instant::now(),
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Exit status, once the leader has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    fn pgid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }

    /// Non-blocking liveness probe of the group leader.
    pub fn is_running(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "failed to poll workload status");
                false
            }
        }
    }

    /// Deliver `signal` to the whole process group.
    ///
    /// A group that no longer exists is not an error.
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        match killpg(self.pgid(), signal) {
            Err(Errno::ESRCH) => Ok(()),
            other => other,
        }
    }

    /// Whether any process in the group is still alive.
    pub fn group_alive(&self) -> bool {
        killpg(self.pgid(), None::<Signal>).is_ok()
    }

    /// Poll until no process in the group exists, for at most `timeout`.
    pub async fn wait_group_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.group_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(GROUP_POLL).await;
        }
        true
    }

    /// Wait up to `timeout` for the leader to exit.
    pub async fn wait(&mut self, timeout: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit {
            return Some(status);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit = Some(status);
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "failed waiting for workload");
                None
            }
            Err(_) => None,
        }
    }

    /// Stop the workload: SIGTERM the group, wait up to `grace`, SIGKILL the
    /// group if needed and wait for it to empty, then join both readers.
    ///
    /// Readers get `reader_budget` each to drain what is left in the pipes;
    /// only a reader that misses it is cancelled.
    pub async fn stop(
        mut self,
        grace: Duration,
        reader_budget: Duration,
        ctx: &SupervisorContext,
    ) -> StopReport {
        let began = Instant::now();
        let mut forced = false;

        if self.is_running() {
            tracing::info!(pid = self.pid, "sending SIGTERM to workload process group");
            if let Err(e) = self.signal(Signal::SIGTERM) {
                tracing::warn!(pid = self.pid, error = %e, "failed to send SIGTERM");
            }

            if self.wait(grace).await.is_none() {
                tracing::warn!(
                    pid = self.pid,
                    grace_secs = grace.as_secs_f64(),
                    "workload didn't terminate gracefully, force killing"
                );
                forced = true;
                self.force_kill().await;
            }
        }

        // Descendants that outlived the leader.
        let mut group_cleared = true;
        if self.group_alive() {
            tracing::debug!(pid = self.pid, "killing remaining process group members");
            if let Err(e) = self.signal(Signal::SIGKILL) {
                tracing::warn!(pid = self.pid, error = %e, "failed to kill process group");
            }
            group_cleared = self.wait_group_exit(GROUP_EXIT_WAIT).await;
            if !group_cleared {
                tracing::warn!(
                    pid = self.pid,
                    "process group members still present after SIGKILL (possibly unreaped)"
                );
            }
        }

        let readers = ctx.join_readers(Some(self.pid), reader_budget).await;

        let report = StopReport {
            pid: self.pid,
            status: self.exit,
            forced,
            group_cleared,
            readers,
            elapsed: began.elapsed(),
        };
        tracing::info!(
            pid = report.pid,
            status = ?report.status,
            forced = report.forced,
            group_cleared = report.group_cleared,
            readers_joined = report.readers.joined,
            readers_abandoned = report.readers.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "workload stopped"
        );
        report
    }

    async fn force_kill(&mut self) {
        if let Err(e) = self.signal(Signal::SIGKILL) {
            tracing::warn!(pid = self.pid, error = %e, "failed to send SIGKILL");
            // Fall back to killing the leader directly.
            if let Err(e) = self.child.start_kill() {
                tracing::warn!(pid = self.pid, error = %e, "failed to kill workload");
            }
        }
        match self.child.wait().await {
            Ok(status) => self.exit = Some(status),
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "failed to reap workload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::test_support::Collector;

    fn spec(command: &str) -> WorkloadSpec {
        WorkloadSpec {
            shell: PathBuf::from("sh"),
            command: command.to_string(),
            workdir: PathBuf::from("."),
            env: ChildEnv::default(),
        }
    }

    #[tokio::test]
    async fn test_start_captures_both_streams() {
        let ctx = SupervisorContext::new();
        let collector = Collector::default();
        let mut workload = Workload::start(
            &spec("echo out-line; echo err-line >&2; echo; exit 3"),
            &ctx,
            &collector.sink(),
        )
        .unwrap();

        let status = workload.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(!workload.is_running());

        let summary = ctx
            .join_readers(Some(workload.pid()), Duration::from_secs(2))
            .await;
        assert_eq!(summary.joined, 2);
        assert_eq!(collector.texts(StreamName::Stdout), vec!["out-line"]);
        assert_eq!(collector.texts(StreamName::Stderr), vec!["err-line"]);
    }

    #[tokio::test]
    async fn test_env_and_workdir_are_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = SupervisorContext::new();
        let collector = Collector::default();
        let mut s = spec("echo \"$HOTPULL_TEST_VAR\"; pwd");
        s.workdir = tmp.path().to_path_buf();
        s.env.set("HOTPULL_TEST_VAR", "from-env");

        let mut workload = Workload::start(&s, &ctx, &collector.sink()).unwrap();
        workload.wait(Duration::from_secs(5)).await.unwrap();
        ctx.join_readers(None, Duration::from_secs(2)).await;

        let out = collector.texts(StreamName::Stdout);
        assert_eq!(out[0], "from-env");
        assert!(out[1].ends_with(tmp.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_spawn_failure_for_missing_shell() {
        let ctx = SupervisorContext::new();
        let mut s = spec("true");
        s.shell = PathBuf::from("/nonexistent/shell-xyz");
        let err = Workload::start(&s, &ctx, &Collector::default().sink())
            .err()
            .unwrap();
        assert!(matches!(err, WorkloadError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn workload"));
        assert_eq!(ctx.active_readers(), 0);
    }

    #[tokio::test]
    async fn test_graceful_stop_terminates_group() {
        let ctx = SupervisorContext::new();
        let workload =
            Workload::start(&spec("exec sleep 30"), &ctx, &Collector::default().sink()).unwrap();
        let pgid = Pid::from_raw(workload.pid() as i32);
        assert!(workload.group_alive());

        let report = workload
            .stop(Duration::from_secs(5), Duration::from_secs(2), &ctx)
            .await;

        assert!(!report.forced);
        assert!(report.status.is_some());
        assert_eq!(report.readers.joined + report.readers.abandoned, 2);
        assert!(report.elapsed < Duration::from_secs(5));
        assert_eq!(killpg(pgid, None::<Signal>), Err(Errno::ESRCH));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill_when_term_ignored() {
        let ctx = SupervisorContext::new();
        let workload = Workload::start(
            &spec("trap '' TERM; exec sleep 30"),
            &ctx,
            &Collector::default().sink(),
        )
        .unwrap();
        let pgid = Pid::from_raw(workload.pid() as i32);
        // Let the shell install the trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = workload
            .stop(Duration::from_millis(300), Duration::from_secs(2), &ctx)
            .await;

        assert!(report.forced);
        assert!(report.elapsed >= Duration::from_millis(300));
        assert!(report.elapsed < Duration::from_secs(5));
        assert_eq!(killpg(pgid, None::<Signal>), Err(Errno::ESRCH));
    }

    async fn wait_for_line(collector: &Collector, stream: StreamName) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(line) = collector.texts(stream).into_iter().next() {
                return line;
            }
            assert!(Instant::now() < deadline, "no {stream} line within 5s");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_stop_keeps_output_printed_on_term() {
        let ctx = SupervisorContext::new();
        let collector = Collector::default();
        let workload = Workload::start(
            &spec("trap 'echo bye; echo gone >&2; exit 0' TERM; echo hi; while :; do sleep 0.05; done"),
            &ctx,
            &collector.sink(),
        )
        .unwrap();
        // "hi" is printed after the trap is installed.
        wait_for_line(&collector, StreamName::Stdout).await;

        let report = workload
            .stop(Duration::from_secs(5), Duration::from_secs(2), &ctx)
            .await;

        assert!(!report.forced);
        assert_eq!(report.status.and_then(|s| s.code()), Some(0));
        assert_eq!(report.readers.joined, 2);
        assert_eq!(collector.texts(StreamName::Stdout), vec!["hi", "bye"]);
        assert_eq!(collector.texts(StreamName::Stderr), vec!["gone"]);
    }

    #[tokio::test]
    async fn test_stop_kills_members_that_outlive_the_leader() {
        use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

        let ctx = SupervisorContext::new();
        let collector = Collector::default();
        let workload = Workload::start(
            &spec("(trap '' TERM; exec sleep 30) & echo $!; exec sleep 30"),
            &ctx,
            &collector.sink(),
        )
        .unwrap();
        let member: u32 = wait_for_line(&collector, StreamName::Stdout)
            .await
            .parse()
            .unwrap();
        // Let the background member install its ignore disposition.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = workload
            .stop(Duration::from_secs(2), Duration::from_secs(2), &ctx)
            .await;
        assert!(!report.forced);
        assert_eq!(report.readers.abandoned, 0);

        // Gone, or at most a zombie waiting for init to reap it.
        let pid = sysinfo::Pid::from_u32(member);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        let status = system.process(pid).map(|p| p.status());
        assert!(
            matches!(status, None | Some(ProcessStatus::Zombie | ProcessStatus::Dead)),
            "group member {member} still running: {status:?}"
        );
    }

    #[tokio::test]
    async fn test_stop_after_exit_is_quick() {
        let ctx = SupervisorContext::new();
        let mut workload =
            Workload::start(&spec("exit 0"), &ctx, &Collector::default().sink()).unwrap();
        workload.wait(Duration::from_secs(5)).await.unwrap();

        let report = workload
            .stop(Duration::from_secs(10), Duration::from_secs(2), &ctx)
            .await;
        assert!(!report.forced);
        assert_eq!(report.status.and_then(|s| s.code()), Some(0));
        assert!(report.elapsed < Duration::from_secs(3));
    }
}
