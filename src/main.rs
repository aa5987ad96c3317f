use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use cluster_backend::access::{ClientOptions, ClusterAccess, KubeClient};
use cluster_backend::backend::minikube::read_running_config;
use cluster_backend::models::backend::{BackendConfig, BackendEvent};
use cluster_backend::models::k8s::ServiceEntry;
use cluster_backend::{create_backend, BackendError, KubernetesBackend, Paths};

/// How long `services`/`forward` wait for the first service listing.
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "cluster-backend", version, about = "Drive the local Kubernetes cluster")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

/// Desired cluster settings; flags override the JSON file.
#[derive(Debug, Args)]
struct Settings {
    /// JSON settings file (camelCase keys)
    #[arg(long, global = true, env = "CLUSTER_BACKEND_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "CLUSTER_BACKEND_KUBERNETES_VERSION")]
    kubernetes_version: Option<String>,

    #[arg(long, global = true, env = "CLUSTER_BACKEND_CPUS")]
    cpus: Option<u32>,

    /// Memory in GiB
    #[arg(long, global = true, env = "CLUSTER_BACKEND_MEMORY")]
    memory: Option<u32>,

    /// Disk size in GiB
    #[arg(long, global = true, env = "CLUSTER_BACKEND_DISK_SIZE")]
    disk_size: Option<u32>,

    #[arg(long, global = true, env = "CLUSTER_BACKEND_CONTAINER_RUNTIME")]
    container_runtime: Option<String>,

    #[arg(long, global = true, env = "CLUSTER_BACKEND_BOOTSTRAPPER")]
    bootstrapper: Option<String>,

    /// Give up waiting for a ready pod after this many seconds
    #[arg(long, global = true)]
    ready_timeout: Option<u64>,
}

impl Settings {
    fn backend_config(&self) -> Result<BackendConfig, BackendError> {
        let mut config = match &self.config {
            Some(path) => BackendConfig::load(path)?,
            None => BackendConfig::default(),
        };
        if let Some(v) = &self.kubernetes_version {
            config.kubernetes_version = v.clone();
        }
        if let Some(cpus) = self.cpus {
            config.cpus = cpus;
        }
        if let Some(memory) = self.memory {
            config.memory_in_gb = memory;
        }
        if let Some(disk) = self.disk_size {
            config.disk_size_in_gb = disk;
        }
        if let Some(rt) = &self.container_runtime {
            config.container_runtime = rt.clone();
        }
        if let Some(bs) = &self.bootstrapper {
            config.bootstrapper = bs.clone();
        }
        Ok(config)
    }

    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            ready_timeout: self.ready_timeout.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the cluster (Ctrl-C interrupts)
    Start,
    Stop,
    /// Delete a stopped cluster
    Delete,
    /// Wipe all workloads of a running cluster in place
    Reset,
    /// Stop, delete and remove all cluster data
    FactoryReset,
    /// Settings that need a restart to take effect
    RestartReasons,
    /// List services of the running cluster
    Services {
        #[arg(long, short)]
        namespace: Option<String>,
    },
    /// Forward a local port to a service until Ctrl-C
    Forward {
        namespace: String,
        service: String,
        port: u16,
    },
    /// Running configuration of the cluster
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BackendError> {
    let paths = Paths::detect().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no data directory for cluster files")
    })?;
    let config = cli.settings.backend_config()?;
    let options = cli.settings.client_options();
    log::debug!("paths: {paths:?}");

    match cli.command {
        Command::Services { namespace } => {
            let client = connect_synced(&paths, options).await?;
            for entry in client.list_services(namespace.as_deref()) {
                let port = entry.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                println!(
                    "{}/{}\t{}\t{}",
                    entry.namespace.as_deref().unwrap_or("-"),
                    entry.name,
                    entry.port_name.as_deref().unwrap_or("-"),
                    port
                );
            }
            client.destroy().await;
        }
        Command::Forward {
            namespace,
            service,
            port,
        } => {
            let client = connect_synced(&paths, options).await?;
            match client.forward_port(Some(&namespace), &service, port).await? {
                Some(local) => {
                    println!("{namespace}/{service}:{port} -> 127.0.0.1:{local}");
                    tokio::signal::ctrl_c().await?;
                    client.cancel_forward_port(Some(&namespace), &service, port).await?;
                }
                None => log::warn!("forward for {namespace}/{service}:{port} was cancelled"),
            }
            client.destroy().await;
        }
        Command::Status => match read_running_config(&paths).await? {
            Some(running) => {
                println!("kubernetes: {}", running.kubernetes_config.kubernetes_version);
                println!("runtime:    {}", running.kubernetes_config.container_runtime);
                println!("cpus:       {}", running.cpus);
                println!("memory:     {}g", running.memory_gb());
                println!("bootstrap:  {}", running.bootstrapper);
            }
            None => println!("no cluster has been created in {}", paths.home.display()),
        },
        command => {
            let backend = create_backend(paths, config, options);
            let _printer = spawn_event_printer(backend.as_ref());
            lifecycle(backend, command).await?;
        }
    }
    Ok(())
}

async fn lifecycle(backend: Arc<dyn KubernetesBackend>, command: Command) -> Result<(), BackendError> {
    match command {
        Command::Start => {
            let starter = Arc::clone(&backend);
            let mut start = tokio::spawn(async move { starter.start().await });
            tokio::select! {
                joined = &mut start => return joined.unwrap_or_else(|e| Err(std::io::Error::other(e).into())),
                _ = tokio::signal::ctrl_c() => {
                    log::info!("interrupt received, stopping");
                    backend.stop().await?;
                }
            }
            start.await.unwrap_or_else(|e| Err(std::io::Error::other(e).into()))?;
        }
        Command::Stop => {
            backend.stop().await?;
        }
        Command::Delete => {
            backend.del().await?;
        }
        Command::Reset => backend.reset().await?,
        Command::FactoryReset => backend.factory_reset().await?,
        Command::RestartReasons => {
            let reasons = backend.requires_restart_reasons().await?;
            println!("{}", serde_json::to_string_pretty(&reasons)?);
        }
        Command::Services { .. } | Command::Forward { .. } | Command::Status => {}
    }
    Ok(())
}

fn spawn_event_printer(backend: &dyn KubernetesBackend) -> tokio::task::JoinHandle<()> {
    let mut events = backend.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let BackendEvent::StateChanged(state) = event {
                println!("{state}");
            }
        }
    })
}

/// Connects to the running cluster and waits for the first service listing.
async fn connect_synced(paths: &Paths, options: ClientOptions) -> Result<KubeClient, BackendError> {
    let client = KubeClient::connect(&paths.kubeconfig, options).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_services_changed(Box::new(move |_: &[ServiceEntry]| {
        let _ = tx.send(());
    }));
    if tokio::time::timeout(SYNC_TIMEOUT, rx.recv()).await.is_err() {
        log::warn!("service listing not synced after {}s", SYNC_TIMEOUT.as_secs());
    }
    Ok(client)
}
