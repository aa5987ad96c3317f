pub mod access;
pub mod backend;
pub mod error;
pub mod models;
pub mod paths;

pub use backend::{create_backend, KubernetesBackend};
pub use error::{BackendError, Result};
pub use models::backend::{BackendConfig, BackendEvent, ClusterState};
pub use paths::Paths;
