//! Status file: writes the supervisor state as JSON on every transition.
//!
//! Uses atomic write pattern: write to temp file then rename.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Supervisor states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Updating,
    Restarting,
    RetryingLaunch,
    ShuttingDown,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: SupervisorState,
    pub branch: String,
    pub repo_dir: String,
    pub workload_pid: Option<u32>,
    pub restarts: u64,
    pub updates: u64,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json = serde_json::to_string_pretty(data)?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".hotpull.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Mutable state tracker that builds StatusData for each update.
///
/// With no path configured every update is a no-op.
pub struct StatusTracker {
    file: Option<StatusFile>,
    pid: u32,
    branch: String,
    repo_dir: String,
    workload_pid: Option<u32>,
    restarts: u64,
    updates: u64,
    started_at: DateTime<Utc>,
}

impl StatusTracker {
    pub fn new(path: Option<PathBuf>, branch: &str, repo_dir: &Path) -> Self {
        Self {
            file: path.map(StatusFile::new),
            pid: std::process::id(),
            branch: branch.to_string(),
            repo_dir: repo_dir.display().to_string(),
            workload_pid: None,
            restarts: 0,
            updates: 0,
            started_at: Utc::now(),
        }
    }

    /// Update and write the status file with the given state.
    pub fn update(&self, state: SupervisorState) {
        let Some(file) = &self.file else {
            return;
        };
        let data = StatusData {
            pid: self.pid,
            state,
            branch: self.branch.clone(),
            repo_dir: self.repo_dir.clone(),
            workload_pid: self.workload_pid,
            restarts: self.restarts,
            updates: self.updates,
            started_at: self.started_at,
            last_update: Utc::now(),
        };

        if let Err(e) = file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_workload_pid(&mut self, pid: Option<u32>) {
        self.workload_pid = pid;
    }

    pub fn record_restart(&mut self) {
        self.restarts += 1;
    }

    pub fn record_update(&mut self) {
        self.updates += 1;
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Remove the status file.
    pub fn remove(&self) {
        if let Some(file) = &self.file {
            file.remove();
        }
    }
}

/// Errors from status file operations.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("failed to serialize status: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write temp status file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rename {} -> {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
