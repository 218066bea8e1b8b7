//! Time-boxed git invocations against the supervised working copy.
//!
//! Every command runs with the repository root as its working directory and
//! is killed if it outlives the configured timeout. Failures are reported as
//! `None` / `false` / an `Unchanged` outcome; nothing here returns an error
//! the polling loop would have to handle.

use crate::environment::ChildEnv;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Result of applying an upstream update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Fast-forward pull succeeded.
    Pulled,
    /// Pull failed; the branch was hard-reset to the remote tip.
    HardReset,
    /// Both pull and reset failed; the on-disk code is unchanged.
    Unchanged,
}

/// Result of a stash maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashCleanup {
    Cleared { count: usize },
    Kept { count: usize },
    Failed,
}

/// Captured output of a finished git command.
#[derive(Debug)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A local working copy tracking `<remote>/<branch>`.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    remote: String,
    branch: String,
    timeout: Duration,
    env: ChildEnv,
    stash_limit: usize,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>, remote: &str, branch: &str, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            remote: remote.to_string(),
            branch: branch.to_string(),
            timeout,
            env: ChildEnv::default(),
            stash_limit: 10,
        }
    }

    pub fn with_env(mut self, env: ChildEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_stash_limit(mut self, limit: usize) -> Self {
        self.stash_limit = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn remote_ref(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }

    /// Whether the working copy has git metadata at all.
    pub fn has_git_dir(&self) -> bool {
        self.root.join(".git").exists()
    }

    /// Run `git <args>` in the repository root.
    ///
    /// Returns `None` if git could not be spawned or timed out. A non-zero
    /// exit is returned as `Some` with `success == false` and logged.
    pub async fn run(&self, args: &[&str]) -> Option<GitOutput> {
        let command_line = format!("git {}", args.join(" "));
        let child = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(command = %command_line, error = %e, "failed to run git command");
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    command = %command_line,
                    timeout_secs = self.timeout.as_secs(),
                    "git command timed out"
                );
                return None;
            }
        };

        let result = GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success && !result.stderr.trim().is_empty() {
            tracing::info!(
                command = %command_line,
                stderr = %result.stderr.trim(),
                "git command failed"
            );
        }
        Some(result)
    }

    /// Run a command and return its trimmed stdout if it succeeded.
    async fn run_ok(&self, args: &[&str]) -> Option<String> {
        match self.run(args).await {
            Some(out) if out.success => Some(out.stdout.trim().to_string()),
            _ => None,
        }
    }

    /// Commit id of `rev`, if it resolves.
    pub async fn rev_parse(&self, rev: &str) -> Option<String> {
        self.run_ok(&["rev-parse", rev]).await
    }

    /// Fetch the remote and compare local HEAD with the remote branch tip.
    ///
    /// Any failure along the way means "no update".
    pub async fn check_for_updates(&self) -> bool {
        if !self.has_git_dir() {
            tracing::error!(root = %self.root.display(), ".git directory not found in repository");
            return false;
        }

        if self.run_ok(&["rev-parse", "--git-dir"]).await.is_none() {
            tracing::warn!("git repository not accessible, auto-update disabled");
            return false;
        }

        if self.run_ok(&["fetch", &self.remote]).await.is_none() {
            tracing::warn!(remote = %self.remote, "failed to fetch from remote");
            return false;
        }

        let local = self.rev_parse("HEAD").await;
        let remote = self.rev_parse(&self.remote_ref()).await;
        match (local, remote) {
            (Some(local), Some(remote)) => {
                tracing::debug!(%local, %remote, "compared commit ids");
                local != remote
            }
            _ => {
                tracing::warn!("failed to get commit hashes");
                false
            }
        }
    }

    /// Bring the working copy up to the remote branch tip.
    ///
    /// Stash local changes (best-effort), try a fast-forward pull, fall back
    /// to a hard reset, and finally give up leaving the tree untouched.
    pub async fn pull_updates(&self) -> UpdateOutcome {
        tracing::info!(branch = %self.branch, "pulling updates");

        match self
            .run(&["stash", "push", "-m", "Auto-stash before update"])
            .await
        {
            Some(out) if out.success => {}
            _ => tracing::warn!("could not stash changes, continuing with pull"),
        }

        if self
            .run_ok(&["pull", "--ff-only", &self.remote, &self.branch])
            .await
            .is_some()
        {
            tracing::info!("successfully pulled updates");
            return UpdateOutcome::Pulled;
        }

        tracing::warn!("pull failed, attempting hard reset");
        let target = self.remote_ref();
        if self.run_ok(&["reset", "--hard", &target]).await.is_some() {
            tracing::info!(target = %target, "successfully updated via hard reset");
            return UpdateOutcome::HardReset;
        }

        tracing::warn!("could not update repository, continuing with existing files");
        UpdateOutcome::Unchanged
    }

    /// Number of stash entries, if `git stash list` succeeds.
    pub async fn stash_count(&self) -> Option<usize> {
        let listing = self.run_ok(&["stash", "list"]).await?;
        Some(listing.lines().filter(|l| !l.trim().is_empty()).count())
    }

    /// Clear all stashes once more than `stash_limit` have accumulated.
    pub async fn cleanup_stashes(&self) -> StashCleanup {
        let Some(count) = self.stash_count().await else {
            tracing::warn!("could not list git stashes");
            return StashCleanup::Failed;
        };
        if count <= self.stash_limit {
            return StashCleanup::Kept { count };
        }

        tracing::info!(count, "cleaning up git stashes");
        if self.run_ok(&["stash", "clear"]).await.is_some() {
            StashCleanup::Cleared { count }
        } else {
            tracing::warn!("could not clear git stashes");
            StashCleanup::Failed
        }
    }
}
