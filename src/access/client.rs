use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EndpointPort, Endpoints, Pod, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Api;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::forwarding::{PodTunnel, PortForwards};
use super::{kubeconfig, services, AccessConnector, ClusterAccess, ServiceListener};
use crate::error::{BackendError, Result};
use crate::models::k8s::{ForwardKey, PodReference, PodTarget, ServiceEntry};

/// Profile (and kubeconfig context) name of the managed cluster.
pub const PROFILE: &str = "cluster-backend";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Kubeconfig context the client pins itself to
    pub context: String,
    /// Delay between endpoint lookups while waiting for a ready pod
    pub poll_interval: Duration,
    /// Upper bound on the ready-pod wait; `None` waits until shutdown
    pub ready_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            context: PROFILE.to_string(),
            poll_interval: Duration::from_secs(1),
            ready_timeout: None,
        }
    }
}

// ── pod readiness ─────────────────────────────────────────────────────────────

/// First ready pod address of `endpoints`, with the ports of its subset.
pub fn ready_pod(endpoints: &Endpoints, namespace: &str) -> Option<(PodReference, Vec<EndpointPort>)> {
    for subset in endpoints.subsets.iter().flatten() {
        for address in subset.addresses.iter().flatten() {
            let Some(target) = &address.target_ref else {
                continue;
            };
            if target.kind.as_deref() != Some("Pod") {
                continue;
            }
            let Some(name) = &target.name else {
                continue;
            };
            let pod = PodReference {
                namespace: target.namespace.clone().unwrap_or_else(|| namespace.to_string()),
                name: name.clone(),
            };
            return Some((pod, subset.ports.clone().unwrap_or_default()));
        }
    }
    None
}

/// Picks the container port a service port maps to.
///
/// Prefers the endpoint port carrying the service port's name, then a lone
/// endpoint port, then a numeric `targetPort`, then the service port itself.
pub fn target_port(service_port: Option<&ServicePort>, endpoint_ports: &[EndpointPort], requested: u16) -> u16 {
    if let Some(declared) = service_port {
        let named = endpoint_ports.iter().find(|ep| ep.name == declared.name);
        if let Some(port) = named.and_then(|ep| u16::try_from(ep.port).ok()) {
            return port;
        }
    }
    if let [only] = endpoint_ports {
        if let Ok(port) = u16::try_from(only.port) {
            return port;
        }
    }
    if let Some(IntOrString::Int(port)) = service_port.and_then(|sp| sp.target_port.as_ref()) {
        if let Ok(port) = u16::try_from(*port) {
            return port;
        }
    }
    requested
}

/// Reads Endpoints objects for the ready-pod wait.
#[async_trait]
pub trait EndpointLookup: Send + Sync + 'static {
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;
}

#[async_trait]
impl EndpointLookup for kube::Client {
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Polls an endpoint until it lists a ready pod.
pub struct ReadyPodWaiter<E> {
    lookup: E,
    shutdown: CancellationToken,
    poll_interval: Duration,
    ready_timeout: Option<Duration>,
}

impl<E: EndpointLookup> ReadyPodWaiter<E> {
    pub fn new(lookup: E, shutdown: CancellationToken, options: &ClientOptions) -> Self {
        Self {
            lookup,
            shutdown,
            poll_interval: options.poll_interval,
            ready_timeout: options.ready_timeout,
        }
    }

    /// There is no attempt limit; the loop ends on shutdown (`None`).
    async fn get_active_pod(&self, namespace: &str, endpoint: &str) -> Option<(PodReference, Vec<EndpointPort>)> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            match self.lookup.endpoints(namespace, endpoint).await {
                Ok(Some(endpoints)) => {
                    if let Some(found) = ready_pod(&endpoints, namespace) {
                        return Some(found);
                    }
                    log::debug!("endpoint {namespace}/{endpoint}: no ready pod yet");
                }
                Ok(None) => log::debug!("endpoint {namespace}/{endpoint}: not found yet"),
                Err(e) => log::debug!("endpoint {namespace}/{endpoint}: {e}"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Waits for a ready pod, bounded by `ready_timeout` when one is set.
    pub async fn wait(&self, namespace: &str, endpoint: &str) -> Result<Option<(PodReference, Vec<EndpointPort>)>> {
        let wait = self.get_active_pod(namespace, endpoint);
        match self.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| BackendError::NotReady {
                    namespace: namespace.to_string(),
                    endpoint: endpoint.to_string(),
                }),
            None => Ok(wait.await),
        }
    }
}

/// Resolves endpoints to pods and relays over the API server's port-forward channel.
struct KubeTunnel {
    client: kube::Client,
    services: Store<Service>,
    pods: ReadyPodWaiter<kube::Client>,
}

#[async_trait]
impl PodTunnel for KubeTunnel {
    async fn resolve(&self, key: &ForwardKey) -> Result<Option<PodTarget>> {
        let Some((pod, endpoint_ports)) = self.pods.wait(&key.namespace, &key.endpoint).await? else {
            return Ok(None);
        };

        let service = self
            .services
            .get(&ObjectRef::new(&key.endpoint).within(&key.namespace));
        let service_port = service.as_deref().and_then(|svc| {
            svc.spec
                .as_ref()?
                .ports
                .as_ref()?
                .iter()
                .find(|p| p.port == i32::from(key.port))
        });
        let port = target_port(service_port, &endpoint_ports, key.port);
        Ok(Some(PodTarget { pod, port }))
    }

    async fn relay(&self, target: &PodTarget, mut conn: TcpStream) -> io::Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.pod.namespace);
        let mut forwarder = pods
            .portforward(&target.pod.name, &[target.port])
            .await
            .map_err(io::Error::other)?;
        let mut upstream = forwarder
            .take_stream(target.port)
            .ok_or_else(|| io::Error::other("port-forward stream unavailable"))?;

        let copied = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
        drop(upstream);
        if let Err(e) = forwarder.join().await {
            log::debug!("port-forward to {}: {e}", target.pod.name);
        }
        copied.map(|_| ())
    }
}

// ── client ────────────────────────────────────────────────────────────────────

struct Inner {
    services: Store<Service>,
    forwards: PortForwards<KubeTunnel>,
    listeners: Mutex<Vec<ServiceListener>>,
    shutdown: CancellationToken,
    watch: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn list_services(&self, namespace: Option<&str>) -> Vec<ServiceEntry> {
        let cached = self.services.state();
        services::flatten_services(cached.iter().map(|svc| &**svc), namespace, |key| {
            self.forwards.forwarded_port(key)
        })
    }

    fn emit_services_changed(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let entries = self.list_services(None);
        let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        for listener in listeners.iter() {
            listener(entries.as_slice());
        }
    }
}

/// Kubernetes API client for the managed cluster: service watch plus port forwards.
pub struct KubeClient {
    inner: Arc<Inner>,
}

impl KubeClient {
    /// Loads the kubeconfig, pins the profile context and starts the service watch.
    pub async fn connect(kubeconfig: &[PathBuf], options: ClientOptions) -> Result<Self> {
        let client = kubeconfig::client_for_context(kubeconfig, &options.context).await?;
        log::info!("cluster access: connected with context {}", options.context);
        Ok(Self::new(client, options))
    }

    /// Starts the service watch on an existing API client.
    pub fn new(client: kube::Client, options: ClientOptions) -> Self {
        let shutdown = CancellationToken::new();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let (store, task) = services::spawn_watch(client.clone(), shutdown.clone(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.emit_services_changed();
                }
            });
            let tunnel = KubeTunnel {
                pods: ReadyPodWaiter::new(client.clone(), shutdown.clone(), &options),
                client,
                services: store.clone(),
            };
            Inner {
                services: store,
                forwards: PortForwards::with_shutdown(Arc::new(tunnel), shutdown.clone()),
                listeners: Mutex::new(Vec::new()),
                shutdown,
                watch: Mutex::new(Some(task)),
            }
        });
        Self { inner }
    }
}

#[async_trait]
impl ClusterAccess for KubeClient {
    fn list_services(&self, namespace: Option<&str>) -> Vec<ServiceEntry> {
        self.inner.list_services(namespace)
    }

    async fn forward_port(&self, namespace: Option<&str>, endpoint: &str, port: u16) -> Result<Option<u16>> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(None);
        }
        let key = ForwardKey::new(namespace, endpoint, port);
        let (local, created) = self.inner.forwards.forward_port(&key).await?;
        if created {
            self.inner.emit_services_changed();
        }
        Ok(local)
    }

    async fn cancel_forward_port(&self, namespace: Option<&str>, endpoint: &str, port: u16) -> Result<()> {
        let key = ForwardKey::new(namespace, endpoint, port);
        if self.inner.forwards.cancel_forward_port(&key).await {
            self.inner.emit_services_changed();
        }
        Ok(())
    }

    fn forwarded_port(&self, namespace: Option<&str>, endpoint: &str, port: u16) -> Option<u16> {
        self.inner
            .forwards
            .forwarded_port(&ForwardKey::new(namespace, endpoint, port))
    }

    fn on_services_changed(&self, listener: ServiceListener) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(listener);
    }

    async fn destroy(&self) {
        self.inner.shutdown.cancel();
        self.inner.forwards.close_all().await;
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        let watch = self.inner.watch.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = watch {
            if let Err(e) = task.await {
                log::warn!("service watch task failed: {e}");
            }
        }
        log::info!("cluster access: shut down");
    }
}

/// Builds [`KubeClient`]s for the lifecycle controller.
#[derive(Debug, Clone)]
pub struct KubeConnector {
    pub kubeconfig: Vec<PathBuf>,
    pub options: ClientOptions,
}

#[async_trait]
impl AccessConnector for KubeConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterAccess>> {
        let client = KubeClient::connect(&self.kubeconfig, self.options.clone()).await?;
        Ok(Arc::new(client))
    }
}
