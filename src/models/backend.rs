use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::k8s::ServiceEntry;

pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_MEMORY_GB: u32 = 2;
pub const DEFAULT_DISK_GB: u32 = 20;

/// Power state of the cluster as seen by the lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Error,
}

impl ClusterState {
    /// States in which no cluster access client may exist.
    pub fn tears_down_client(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped | Self::Error)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Desired cluster configuration, supplied by the settings layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// e.g. "v1.30.2"
    pub kubernetes_version: String,
    pub cpus: u32,
    #[serde(rename = "memoryInGB")]
    pub memory_in_gb: u32,
    #[serde(rename = "diskSizeInGB")]
    pub disk_size_in_gb: u32,
    pub container_runtime: String,
    pub bootstrapper: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kubernetes_version: String::new(),
            cpus: DEFAULT_CPUS,
            memory_in_gb: DEFAULT_MEMORY_GB,
            disk_size_in_gb: DEFAULT_DISK_GB,
            container_runtime: "containerd".to_string(),
            bootstrapper: "k3s".to_string(),
        }
    }
}

impl BackendConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, crate::error::BackendError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Notifications published to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum BackendEvent {
    StateChanged(ClusterState),
    ServiceChanged(Vec<ServiceEntry>),
}

/// Reason key -> `[actual, desired]`, only for settings that differ.
pub type RestartReasons = BTreeMap<String, (serde_json::Value, serde_json::Value)>;
