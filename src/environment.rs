//! Repository-root resolution, container detection, and the environment
//! variables handed to every git and workload invocation.

use crate::config::{EnvironmentConfig, RepositoryConfig};
use std::path::{Path, PathBuf};

/// Marker file present in Docker containers.
pub const CONTAINER_MARKER: &str = "/.dockerenv";

/// Variables applied to spawned children, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildEnv {
    vars: Vec<(String, String)>,
}

impl ChildEnv {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Resolve the repository root.
///
/// An explicit `dir` wins. Otherwise the mount path is used if it holds a
/// `.git` directory, else the relative fallback.
pub fn resolve_repo_root(config: &RepositoryConfig) -> PathBuf {
    if let Some(dir) = &config.dir {
        return dir.clone();
    }
    if config.mount_path.join(".git").exists() {
        return config.mount_path.clone();
    }
    config.fallback_dir.clone()
}

/// Whether the supervisor runs inside an isolated container.
pub fn detect_container(forced: Option<bool>) -> bool {
    forced.unwrap_or_else(|| Path::new(CONTAINER_MARKER).exists())
}

/// Build the child environment.
///
/// Cross-filesystem git discovery is always enabled; the package-path
/// redirects only apply in container mode.
pub fn child_env(container: bool, mount_path: &Path, config: &EnvironmentConfig) -> ChildEnv {
    let mut env = ChildEnv::default();
    env.set("GIT_DISCOVERY_ACROSS_FILESYSTEM", "1");
    if container {
        let mount = mount_path.to_string_lossy();
        for (key, value) in &config.container_vars {
            env.set(key.as_str(), value.replace("{mount}", &mount));
        }
    }
    env
}

/// Create the package-installation redirect directory, best-effort.
pub fn prepare_container_dirs(env: &ChildEnv) {
    let Some(base) = env.get("PYTHONUSERBASE") else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(base) {
        tracing::debug!(error = %e, path = base, "could not create package directory");
    }
}
