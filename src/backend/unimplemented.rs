use async_trait::async_trait;
use tokio::sync::broadcast;

use super::KubernetesBackend;
use crate::error::{BackendError, Result};
use crate::models::backend::{BackendConfig, BackendEvent, ClusterState, RestartReasons};
use crate::models::k8s::ServiceEntry;

/// Backend for hosts without a supported controller.
pub struct UnimplementedBackend {
    events: broadcast::Sender<BackendEvent>,
}

impl UnimplementedBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for UnimplementedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KubernetesBackend for UnimplementedBackend {
    fn state(&self) -> ClusterState {
        ClusterState::Stopped
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    async fn start(&self) -> Result<()> {
        Err(BackendError::NotImplemented("start"))
    }

    async fn stop(&self) -> Result<i32> {
        Err(BackendError::NotImplemented("stop"))
    }

    async fn del(&self) -> Result<i32> {
        Err(BackendError::NotImplemented("delete"))
    }

    async fn reset(&self) -> Result<()> {
        Err(BackendError::NotImplemented("reset"))
    }

    async fn factory_reset(&self) -> Result<()> {
        Err(BackendError::NotImplemented("factory reset"))
    }

    async fn requires_restart_reasons(&self) -> Result<RestartReasons> {
        Err(BackendError::NotImplemented("restart check"))
    }

    async fn version(&self) -> Result<String> {
        Err(BackendError::NotImplemented("version"))
    }

    async fn cpus(&self) -> Result<u32> {
        Err(BackendError::NotImplemented("cpus"))
    }

    async fn memory(&self) -> Result<u32> {
        Err(BackendError::NotImplemented("memory"))
    }

    fn list_services(&self, _namespace: Option<&str>) -> Vec<ServiceEntry> {
        Vec::new()
    }

    async fn forward_port(&self, _namespace: Option<&str>, _service: &str, _port: u16) -> Result<Option<u16>> {
        Err(BackendError::NotImplemented("port forwarding"))
    }

    async fn cancel_forward(&self, _namespace: Option<&str>, _service: &str, _port: u16) -> Result<()> {
        Err(BackendError::NotImplemented("port forwarding"))
    }

    fn update_settings(&self, config: BackendConfig) {
        log::debug!("ignoring settings on unsupported platform: {config:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_operation_reports_not_implemented() {
        let backend = UnimplementedBackend::new();
        backend.update_settings(BackendConfig::default());
        assert!(matches!(backend.start().await, Err(BackendError::NotImplemented("start"))));
        assert!(matches!(backend.stop().await, Err(BackendError::NotImplemented(_))));
        assert!(matches!(backend.del().await, Err(BackendError::NotImplemented(_))));
        assert!(matches!(backend.reset().await, Err(BackendError::NotImplemented(_))));
        assert!(matches!(backend.forward_port(None, "web", 80).await, Err(BackendError::NotImplemented(_))));
        assert_eq!(backend.state(), ClusterState::Stopped);
        assert!(backend.list_services(None).is_empty());
    }
}
