//! Public backend contract, its platform implementations and the factory.

pub mod downgrade;
pub mod minikube;
pub mod process;
pub mod unimplemented;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::access::{ClientOptions, KubeConnector};
use crate::error::Result;
use crate::models::backend::{BackendConfig, BackendEvent, ClusterState, RestartReasons};
use crate::models::k8s::ServiceEntry;
use crate::paths::Paths;

pub use minikube::MinikubeBackend;
pub use process::{Orchestrator, Platform};
pub use unimplemented::UnimplementedBackend;

/// Operations the UI layer drives a cluster backend with.
#[async_trait]
pub trait KubernetesBackend: Send + Sync {
    fn state(&self) -> ClusterState;

    /// `state-changed` and `service-changed` notifications.
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;

    async fn start(&self) -> Result<()>;

    /// Returns the exit code of the provisioning binary.
    async fn stop(&self) -> Result<i32>;

    /// Deletes a stopped cluster; returns the exit code of the provisioning binary.
    async fn del(&self) -> Result<i32>;

    /// Wipes workloads in place; no-op unless the cluster is started.
    async fn reset(&self) -> Result<()>;

    /// Stops and deletes the cluster, then removes all persisted cluster data.
    async fn factory_reset(&self) -> Result<()>;

    /// Settings whose running value differs from the desired one.
    async fn requires_restart_reasons(&self) -> Result<RestartReasons>;

    /// Kubernetes version of the running cluster.
    async fn version(&self) -> Result<String>;

    async fn cpus(&self) -> Result<u32>;

    /// Memory of the running cluster in GiB.
    async fn memory(&self) -> Result<u32>;

    fn list_services(&self, namespace: Option<&str>) -> Vec<ServiceEntry>;

    async fn forward_port(&self, namespace: Option<&str>, service: &str, port: u16) -> Result<Option<u16>>;

    async fn cancel_forward(&self, namespace: Option<&str>, service: &str, port: u16) -> Result<()>;

    /// Replaces the desired configuration without touching the cluster.
    fn update_settings(&self, config: BackendConfig);
}

/// Builds the backend implementation for the host platform.
pub fn create_backend(paths: Paths, config: BackendConfig, options: ClientOptions) -> Arc<dyn KubernetesBackend> {
    let platform = Platform::current();
    match platform {
        Platform::MacOs | Platform::Linux => {
            let provisioner = Arc::new(Orchestrator::with_platform(paths.clone(), platform));
            let connector = Arc::new(KubeConnector {
                kubeconfig: paths.kubeconfig.clone(),
                options,
            });
            Arc::new(MinikubeBackend::new(config, paths, platform, provisioner, connector))
        }
        Platform::Windows | Platform::Other => {
            log::warn!("no cluster backend for {platform:?}");
            Arc::new(UnimplementedBackend::new())
        }
    }
}
