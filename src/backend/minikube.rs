//! Lifecycle controller driving a minikube-provisioned cluster.
//!
//! State only changes through `MinikubeBackend::transition`, which publishes
//! `state-changed` before tearing down the cluster access client. At most one
//! of start/stop/delete/reset runs at a time; waiters on the operation lock
//! are served in FIFO order.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::process::{Operation, Outcome, Platform, Provisioner, BINARY};
use super::KubernetesBackend;
use crate::access::{AccessConnector, ClusterAccess, PROFILE};
use crate::error::{BackendError, ExitStatus, ProcessFailure, Result};
use crate::models::backend::{
    BackendConfig, BackendEvent, ClusterState, RestartReasons, DEFAULT_CPUS, DEFAULT_DISK_GB,
    DEFAULT_MEMORY_GB,
};
use crate::models::k8s::ServiceEntry;
use crate::paths::Paths;

/// Node-level service restarted by `reset`.
const RESET_SERVICE: &str = "k3s";
/// Datastore wiped by `reset`.
const RESET_STATE_DIR: &str = "/var/lib/rancher/k3s/server/db";

const EVENT_CAPACITY: usize = 64;

/// Subset of the running configuration the provisioning binary writes per profile.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RunningConfig {
    #[serde(rename = "CPUs")]
    pub cpus: u32,
    /// MiB
    pub memory: u32,
    pub bootstrapper: String,
    pub kubernetes_config: RunningKubernetesConfig,
}

impl RunningConfig {
    /// Memory rounded to the nearest GiB.
    pub fn memory_gb(&self) -> u32 {
        self.memory.saturating_add(512) / 1024
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RunningKubernetesConfig {
    pub kubernetes_version: String,
    pub container_runtime: String,
}

/// Reads the running configuration; `None` when the cluster never wrote one.
pub async fn read_running_config(paths: &Paths) -> Result<Option<RunningConfig>> {
    let path = paths.running_config(PROFILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Compares the running configuration against the desired one.
pub fn restart_reasons(running: &RunningConfig, desired: &BackendConfig) -> RestartReasons {
    let mut reasons = BTreeMap::new();
    if running.cpus != desired.cpus {
        reasons.insert("cpu".to_string(), (json!(running.cpus), json!(desired.cpus)));
    }
    if u64::from(running.memory) != u64::from(desired.memory_in_gb) * 1024 {
        reasons.insert(
            "memory".to_string(),
            (json!(running.memory_gb()), json!(desired.memory_in_gb)),
        );
    }
    if running.bootstrapper != desired.bootstrapper {
        reasons.insert(
            "bootstrapper".to_string(),
            (json!(running.bootstrapper), json!(desired.bootstrapper)),
        );
    }
    reasons
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MinikubeBackend {
    config: RwLock<BackendConfig>,
    paths: Paths,
    platform: Platform,
    provisioner: Arc<dyn Provisioner>,
    connector: Arc<dyn AccessConnector>,
    state: Mutex<ClusterState>,
    client: Mutex<Option<Arc<dyn ClusterAccess>>>,
    operation: tokio::sync::Mutex<()>,
    start_interrupt: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<BackendEvent>,
}

impl MinikubeBackend {
    pub fn new(
        config: BackendConfig,
        paths: Paths,
        platform: Platform,
        provisioner: Arc<dyn Provisioner>,
        connector: Arc<dyn AccessConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: RwLock::new(config),
            paths,
            platform,
            provisioner,
            connector,
            state: Mutex::new(ClusterState::Stopped),
            client: Mutex::new(None),
            operation: tokio::sync::Mutex::new(()),
            start_interrupt: Mutex::new(None),
            events,
        }
    }

    fn config(&self) -> BackendConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn client(&self) -> Option<Arc<dyn ClusterAccess>> {
        lock(&self.client).clone()
    }

    /// Commits a state change: notify first, then tear down the access client.
    async fn transition(&self, next: ClusterState) {
        let previous = std::mem::replace(&mut *lock(&self.state), next);
        log::info!("cluster state: {previous} -> {next}");
        let _ = self.events.send(BackendEvent::StateChanged(next));

        if next.tears_down_client() {
            let client = lock(&self.client).take();
            if let Some(client) = client {
                client.destroy().await;
            }
        }
    }

    fn common_args(&self, op: Operation, config: &BackendConfig) -> Vec<String> {
        vec![
            op.subcommand().to_string(),
            "-p".to_string(),
            PROFILE.to_string(),
            "--bootstrapper".to_string(),
            config.bootstrapper.clone(),
            "--driver".to_string(),
            self.platform.driver().to_string(),
            "--container-runtime".to_string(),
            config.container_runtime.clone(),
        ]
    }

    pub fn start_args(&self, config: &BackendConfig) -> Vec<String> {
        let mut args = self.common_args(Operation::Start, config);
        args.push("--interactive=false".to_string());
        if !config.kubernetes_version.is_empty() {
            args.push(format!("--kubernetes-version={}", config.kubernetes_version));
        }
        if config.memory_in_gb != DEFAULT_MEMORY_GB {
            args.push(format!("--memory={}g", config.memory_in_gb));
        }
        if config.cpus != DEFAULT_CPUS {
            args.push(format!("--cpus={}", config.cpus));
        }
        if config.disk_size_in_gb != DEFAULT_DISK_GB {
            args.push(format!("--disk-size={}g", config.disk_size_in_gb));
        }
        args
    }

    fn ssh_args(command: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = ["ssh", "-p", PROFILE, "--", "sudo"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(command.iter().map(|s| s.to_string()));
        args
    }

    /// Start body; `nested` marks the retry after privilege escalation.
    fn start_locked(&self, nested: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let state = self.state();
            if !nested && !matches!(state, ClusterState::Stopped | ClusterState::Error) {
                return Err(BackendError::InvalidState {
                    operation: "start",
                    state,
                });
            }

            let interrupt = CancellationToken::new();
            *lock(&self.start_interrupt) = Some(interrupt.clone());
            if state != ClusterState::Starting {
                self.transition(ClusterState::Starting).await;
            }

            let config = self.config();
            let outcome = self
                .provisioner
                .run(Operation::Start, self.start_args(&config), Some(interrupt))
                .await;
            *lock(&self.start_interrupt) = None;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.transition(ClusterState::Error).await;
                    return Err(e);
                }
            };

            match outcome {
                Outcome::Success { .. } => {
                    self.transition(ClusterState::Started).await;
                    self.attach_client().await
                }
                Outcome::EscalationRequired(_) if !nested => {
                    log::info!("{BINARY} needs elevated permissions, escalating once");
                    if let Err(e) = self.provisioner.escalate().await {
                        self.transition(ClusterState::Error).await;
                        return Err(e);
                    }
                    self.start_locked(true).await
                }
                Outcome::EscalationRequired(failure) => {
                    self.transition(ClusterState::Error).await;
                    Err(BackendError::Start(failure))
                }
                Outcome::Interrupted => {
                    log::info!("start interrupted");
                    self.transition(ClusterState::Stopped).await;
                    Ok(())
                }
                Outcome::Failed(failure) => {
                    self.transition(ClusterState::Error).await;
                    Err(BackendError::Start(failure))
                }
            }
        })
    }

    /// Creates the access client and relays its service notifications.
    async fn attach_client(&self) -> Result<()> {
        let client = match self.connector.connect().await {
            Ok(client) => client,
            Err(e) => {
                log::error!("cluster access unavailable: {e}");
                self.transition(ClusterState::Error).await;
                return Err(e);
            }
        };

        let events = self.events.clone();
        client.on_services_changed(Box::new(move |entries: &[ServiceEntry]| {
            let _ = events.send(BackendEvent::ServiceChanged(entries.to_vec()));
        }));

        let stale = {
            let state = lock(&self.state);
            if *state == ClusterState::Started {
                *lock(&self.client) = Some(Arc::clone(&client));
                false
            } else {
                true
            }
        };
        if stale {
            log::info!("cluster left started state while connecting, dropping client");
            client.destroy().await;
        }
        Ok(())
    }

    /// Runs a command that has no interrupt or escalation path of its own.
    async fn run_checked(
        &self,
        op: Operation,
        args: Vec<String>,
    ) -> Result<std::result::Result<Outcome, ProcessFailure>> {
        let outcome = self.provisioner.run(op, args, None).await?;
        Ok(match outcome {
            Outcome::Success { .. } => Ok(outcome),
            Outcome::Failed(failure) | Outcome::EscalationRequired(failure) => Err(failure),
            Outcome::Interrupted => Err(ProcessFailure {
                context: format!("{BINARY} {}", op.subcommand()),
                status: ExitStatus::Signal(libc::SIGINT),
                message: String::new(),
            }),
        })
    }

    pub async fn running_config(&self) -> Result<Option<RunningConfig>> {
        read_running_config(&self.paths).await
    }

    async fn started_config(&self) -> Result<Option<RunningConfig>> {
        if self.state() != ClusterState::Started {
            return Ok(None);
        }
        self.running_config().await
    }
}

#[async_trait]
impl KubernetesBackend for MinikubeBackend {
    fn state(&self) -> ClusterState {
        *lock(&self.state)
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    async fn start(&self) -> Result<()> {
        let _operation = self.operation.lock().await;
        self.start_locked(false).await
    }

    async fn stop(&self) -> Result<i32> {
        let interrupt = lock(&self.start_interrupt).clone();
        if let Some(interrupt) = interrupt {
            log::info!("stop requested during start, interrupting");
            interrupt.cancel();
        }
        let _operation = self.operation.lock().await;
        if self.state() == ClusterState::Stopped {
            return Ok(0);
        }

        self.transition(ClusterState::Stopping).await;
        let args = self.common_args(Operation::Stop, &self.config());
        let outcome = match self.run_checked(Operation::Stop, args).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.transition(ClusterState::Error).await;
                return Err(e);
            }
        };
        match outcome {
            Ok(_) => {}
            Err(failure) if failure.exit_code().is_none() => {
                log::info!("{} ended without an exit code, treating as stopped", failure.context);
            }
            Err(failure) => {
                self.transition(ClusterState::Error).await;
                return Err(BackendError::Stop(failure));
            }
        }
        self.transition(ClusterState::Stopped).await;
        Ok(0)
    }

    async fn del(&self) -> Result<i32> {
        let _operation = self.operation.lock().await;
        let state = self.state();
        if state != ClusterState::Stopped {
            return Err(BackendError::InvalidState {
                operation: "delete",
                state,
            });
        }

        let args = self.common_args(Operation::Delete, &self.config());
        match self.run_checked(Operation::Delete, args).await {
            Ok(Ok(_)) => Ok(0),
            Ok(Err(failure)) => {
                self.transition(ClusterState::Error).await;
                Err(BackendError::Delete(failure))
            }
            Err(e) => {
                self.transition(ClusterState::Error).await;
                Err(e)
            }
        }
    }

    async fn reset(&self) -> Result<()> {
        let _operation = self.operation.lock().await;
        if self.state() != ClusterState::Started {
            return Ok(());
        }

        self.transition(ClusterState::Starting).await;
        let client = lock(&self.client).take();
        if let Some(client) = client {
            client.destroy().await;
        }

        let steps: [[&str; 3]; 3] = [
            ["systemctl", "stop", RESET_SERVICE],
            ["rm", "-rf", RESET_STATE_DIR],
            ["systemctl", "start", RESET_SERVICE],
        ];
        for step in steps {
            match self.run_checked(Operation::Ssh, Self::ssh_args(&step)).await {
                Ok(Ok(_)) => {}
                Ok(Err(failure)) => {
                    self.transition(ClusterState::Error).await;
                    return Err(BackendError::Reset(failure));
                }
                Err(e) => {
                    self.transition(ClusterState::Error).await;
                    return Err(e);
                }
            }
        }

        // Any transition that landed while the remote steps ran wins.
        let state = self.state();
        if state != ClusterState::Starting {
            log::info!("cluster moved to {state} during reset, not restoring");
            return Ok(());
        }
        self.transition(ClusterState::Started).await;
        self.attach_client().await
    }

    async fn factory_reset(&self) -> Result<()> {
        if self.state() != ClusterState::Stopped {
            self.stop().await?;
        }
        self.del().await?;

        match tokio::fs::remove_dir_all(&self.paths.home).await {
            Ok(()) => log::info!("removed {}", self.paths.home.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn requires_restart_reasons(&self) -> Result<RestartReasons> {
        let Some(running) = self.running_config().await? else {
            return Ok(RestartReasons::new());
        };
        Ok(restart_reasons(&running, &self.config()))
    }

    async fn version(&self) -> Result<String> {
        Ok(self
            .started_config()
            .await?
            .map(|c| c.kubernetes_config.kubernetes_version)
            .unwrap_or_default())
    }

    async fn cpus(&self) -> Result<u32> {
        Ok(self.started_config().await?.map_or(0, |c| c.cpus))
    }

    async fn memory(&self) -> Result<u32> {
        Ok(self.started_config().await?.map_or(0, |c| c.memory_gb()))
    }

    fn list_services(&self, namespace: Option<&str>) -> Vec<ServiceEntry> {
        self.client()
            .map(|client| client.list_services(namespace))
            .unwrap_or_default()
    }

    async fn forward_port(&self, namespace: Option<&str>, service: &str, port: u16) -> Result<Option<u16>> {
        match self.client() {
            Some(client) => client.forward_port(namespace, service, port).await,
            None => Ok(None),
        }
    }

    async fn cancel_forward(&self, namespace: Option<&str>, service: &str, port: u16) -> Result<()> {
        match self.client() {
            Some(client) => client.cancel_forward_port(namespace, service, port).await,
            None => Ok(()),
        }
    }

    fn update_settings(&self, config: BackendConfig) {
        log::debug!("settings updated: {config:?}");
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }
}
