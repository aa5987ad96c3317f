use std::fmt;

use thiserror::Error;

use crate::models::backend::ClusterState;

pub type Result<T> = std::result::Result<T, BackendError>;

/// How a provisioning subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(sig) => write!(f, "signal {sig}"),
            Self::Unknown => f.write_str("unknown status"),
        }
    }
}

/// Diagnostic carried by every lifecycle failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    /// Command that failed, e.g. `minikube start`
    pub context: String,
    pub status: ExitStatus,
    /// Raw (or reformatted) stderr of the provisioning binary
    pub message: String,
}

impl ProcessFailure {
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            ExitStatus::Code(code) => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with {}", self.context, self.status)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to start cluster: {0}")]
    Start(ProcessFailure),

    #[error("failed to stop cluster: {0}")]
    Stop(ProcessFailure),

    #[error("failed to delete cluster: {0}")]
    Delete(ProcessFailure),

    #[error("failed to reset cluster: {0}")]
    Reset(ProcessFailure),

    #[error("cannot {operation} while the cluster is {state}")]
    InvalidState {
        operation: &'static str,
        state: ClusterState,
    },

    #[error("no ready pod backs endpoint {namespace}/{endpoint}")]
    NotReady { namespace: String, endpoint: String },

    #[error("{0} is not implemented on this platform")]
    NotImplemented(&'static str),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
}

impl BackendError {
    /// The provisioning diagnostic, if this is a lifecycle failure.
    pub fn process_failure(&self) -> Option<&ProcessFailure> {
        match self {
            Self::Start(f) | Self::Stop(f) | Self::Delete(f) | Self::Reset(f) => Some(f),
            _ => None,
        }
    }
}
