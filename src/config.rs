use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from hotpull.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SupervisorConfig {
    pub repository: RepositoryConfig,
    pub workload: WorkloadConfig,
    pub timing: TimingConfig,
    pub maintenance: MaintenanceConfig,
    pub environment: EnvironmentConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Explicit repository root. When unset the mount path / fallback probe is used.
    pub dir: Option<PathBuf>,
    pub mount_path: PathBuf,
    pub fallback_dir: PathBuf,
    pub branch: String,
    pub remote: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub command: String,
    pub shell: PathBuf,
    pub workdir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_secs: u64,
    pub launch_retry_secs: u64,
    pub git_timeout_secs: u64,
    pub graceful_stop_secs: u64,
    pub reader_join_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub diagnostics_every: u32,
    pub stash_cleanup_every: u32,
    pub stash_limit: usize,
    /// Force container mode on or off. Unset means detect via `/.dockerenv`.
    pub container: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Extra variables set for git and the workload in container mode.
    /// `{mount}` is replaced with the mount path.
    pub container_vars: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file: String,
    pub max_bytes: u64,
    pub backups: usize,
    pub status_file: Option<PathBuf>,
}

/// Errors from loading the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Timing knobs resolved into `Duration`s for the supervisor loop.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub poll_interval: Duration,
    pub launch_retry: Duration,
    pub git_timeout: Duration,
    pub graceful_stop: Duration,
    pub reader_join: Duration,
}

impl SupervisorConfig {
    /// Load config from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn timing(&self) -> Timing {
        Timing::from(&self.timing)
    }

    /// Full path of the active log file.
    pub fn log_path(&self) -> PathBuf {
        self.logging.dir.join(&self.logging.file)
    }
}

impl From<&TimingConfig> for Timing {
    fn from(t: &TimingConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(t.poll_interval_secs),
            launch_retry: Duration::from_secs(t.launch_retry_secs),
            git_timeout: Duration::from_secs(t.git_timeout_secs),
            graceful_stop: Duration::from_secs(t.graceful_stop_secs),
            reader_join: Duration::from_secs(t.reader_join_secs),
        }
    }
}

// --- Default implementations ---

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            dir: None,
            mount_path: PathBuf::from("/app"),
            fallback_dir: PathBuf::from(".."),
            branch: "main".to_string(),
            remote: "origin".to_string(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            command: "npm run start-prod".to_string(),
            shell: PathBuf::from("sh"),
            workdir: PathBuf::from("."),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            launch_retry_secs: 10,
            git_timeout_secs: 30,
            graceful_stop_secs: 10,
            reader_join_secs: 2,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            diagnostics_every: 60,
            stash_cleanup_every: 360,
            stash_limit: 10,
            container: None,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        let mut container_vars = BTreeMap::new();
        container_vars.insert("PYTHONUSERBASE".to_string(), "{mount}/.local".to_string());
        container_vars.insert("PIP_USER".to_string(), "1".to_string());
        Self { container_vars }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file: "process.log".to_string(),
            max_bytes: 10 * 1024 * 1024,
            backups: 5,
            status_file: Some(PathBuf::from("logs/supervisor.status")),
        }
    }
}
