//! Filesystem locations shared by the orchestrator and the access client.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "cluster-backend";

/// Overrides the profile-data home handed to the provisioning binary.
pub const HOME_ENV: &str = "CLUSTER_BACKEND_HOME";
/// Overrides the bundled resource directory.
pub const RESOURCES_ENV: &str = "CLUSTER_BACKEND_RESOURCES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Dedicated profile-data home, isolated from any system-wide install
    pub home: PathBuf,
    /// Bundled binaries, prepended to the subprocess search path
    pub resources: PathBuf,
    /// Kubeconfig files, in merge order
    pub kubeconfig: Vec<PathBuf>,
}

impl Paths {
    /// Resolves paths from the environment, falling back to the platform data dir.
    pub fn detect() -> Option<Self> {
        let base = dirs::data_dir().map(|d| d.join(APP_DIR));
        let home = env_path(HOME_ENV).or_else(|| base.as_ref().map(|b| b.join("minikube")))?;
        let resources = env_path(RESOURCES_ENV).or_else(|| base.map(|b| b.join("resources")))?;
        Some(Self {
            home,
            resources,
            kubeconfig: kubeconfig_paths(),
        })
    }

    /// Running configuration the provisioning binary writes for `profile`.
    pub fn running_config(&self, profile: &str) -> PathBuf {
        self.home
            .join(".minikube")
            .join("profiles")
            .join(profile)
            .join("config.json")
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Kubeconfig files to load.
/// Respects KUBECONFIG env var (`:` on Unix, `;` on Windows), then ~/.kube/config.
pub fn kubeconfig_paths() -> Vec<PathBuf> {
    let from_env: Vec<PathBuf> = std::env::var_os("KUBECONFIG")
        .map(|v| std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default();

    if !from_env.is_empty() {
        return from_env;
    }
    dirs::home_dir()
        .map(|h| vec![h.join(".kube").join("config")])
        .unwrap_or_default()
}

/// Builds a search path with `first` ahead of the inherited `PATH`.
pub fn prepend_search_path(first: &Path) -> Option<std::ffi::OsString> {
    let mut entries = vec![first.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        entries.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(entries).ok()
}
