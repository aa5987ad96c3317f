//! Cluster access layer: service watch, pod readiness and port forwarding.

pub mod client;
pub mod forwarding;
pub mod kubeconfig;
pub mod services;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::k8s::ServiceEntry;

pub use client::{ClientOptions, KubeClient, KubeConnector, PROFILE};

/// Receives the full flattened service list after every change.
pub type ServiceListener = Box<dyn Fn(&[ServiceEntry]) + Send + Sync>;

/// Object surface the lifecycle controller and the UI layer use while the cluster runs.
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    /// Services in the watch cache, optionally filtered by namespace.
    fn list_services(&self, namespace: Option<&str>) -> Vec<ServiceEntry>;

    /// Ensures a forward exists and returns its local port; `None` if it was
    /// cancelled concurrently or the client is shut down.
    async fn forward_port(&self, namespace: Option<&str>, endpoint: &str, port: u16) -> Result<Option<u16>>;

    async fn cancel_forward_port(&self, namespace: Option<&str>, endpoint: &str, port: u16) -> Result<()>;

    fn forwarded_port(&self, namespace: Option<&str>, endpoint: &str, port: u16) -> Option<u16>;

    fn on_services_changed(&self, listener: ServiceListener);

    /// Shuts down: closes all forwards and drops every listener.
    async fn destroy(&self);
}

/// Creates a [`ClusterAccess`] once the cluster has started.
#[async_trait]
pub trait AccessConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ClusterAccess>>;
}
