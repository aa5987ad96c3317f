//! Forwarding table and the loopback listeners that proxy into cluster pods.
//!
//! The table records desired state: a key is present while forwarding for that
//! (namespace, endpoint, port) triple should exist. A key is registered before
//! its listener is bound, so a cancel that lands mid-setup removes the
//! registration and the setup path closes the listener once bind completes.
//! The same holds for shutdown: both checks run under the table lock, and
//! `close_all` drains the table only after the shutdown token is cancelled.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::k8s::{ForwardKey, PodTarget};

/// Transport from an accepted local connection into the cluster.
#[async_trait]
pub trait PodTunnel: Send + Sync + 'static {
    /// Waits for a ready pod behind the key's endpoint. `None` when the client shut down.
    async fn resolve(&self, key: &ForwardKey) -> Result<Option<PodTarget>>;

    /// Relays `conn` to the pod until either side closes.
    async fn relay(&self, target: &PodTarget, conn: TcpStream) -> io::Result<()>;
}

struct Slot {
    id: u64,
    /// `None` until the listener is bound
    port: watch::Receiver<Option<u16>>,
    close: CancellationToken,
    task: Option<JoinHandle<()>>,
}

type Table = Arc<Mutex<HashMap<ForwardKey, Slot>>>;

fn lock(table: &Mutex<HashMap<ForwardKey, Slot>>) -> MutexGuard<'_, HashMap<ForwardKey, Slot>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs between binding a listener and committing it to the table.
#[cfg(test)]
type BindHook = Arc<dyn Fn(u16) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Port-forward manager: owns the forwarding table and its listeners.
pub struct PortForwards<T> {
    table: Table,
    tunnel: Arc<T>,
    next_id: AtomicU64,
    /// Once cancelled, no listener is registered or started.
    shutdown: CancellationToken,
    #[cfg(test)]
    after_bind: Option<BindHook>,
}

impl<T: PodTunnel> PortForwards<T> {
    pub fn new(tunnel: Arc<T>) -> Self {
        Self::with_shutdown(tunnel, CancellationToken::new())
    }

    pub fn with_shutdown(tunnel: Arc<T>, shutdown: CancellationToken) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            tunnel,
            next_id: AtomicU64::new(1),
            shutdown,
            #[cfg(test)]
            after_bind: None,
        }
    }

    /// Starts a listener for `key` unless one is already registered.
    ///
    /// Returns `true` only when this call created and bound a new listener.
    pub async fn create_forwarding_server(&self, key: &ForwardKey) -> Result<bool> {
        let (id, port_tx) = {
            let mut table = lock(&self.table);
            if self.shutdown.is_cancelled() || table.contains_key(key) {
                return Ok(false);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (port_tx, port_rx) = watch::channel(None);
            table.insert(
                key.clone(),
                Slot {
                    id,
                    port: port_rx,
                    close: CancellationToken::new(),
                    task: None,
                },
            );
            (id, port_tx)
        };

        let bound = async {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
            let port = listener.local_addr()?.port();
            io::Result::Ok((listener, port))
        }
        .await;

        let (listener, port) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.remove_if_current(key, id);
                log::warn!("forwarding {key}: failed to bind listener: {e}");
                return Err(e.into());
            }
        };

        #[cfg(test)]
        if let Some(hook) = &self.after_bind {
            hook(port).await;
        }

        let mut table = lock(&self.table);
        if self.shutdown.is_cancelled() {
            if table.get(key).is_some_and(|slot| slot.id == id) {
                table.remove(key);
            }
            drop(listener);
            log::info!("forwarding {key}: shut down during setup, closed 127.0.0.1:{port}");
            return Ok(false);
        }
        match table.get_mut(key) {
            Some(slot) if slot.id == id => {
                slot.task = Some(tokio::spawn(serve(
                    listener,
                    key.clone(),
                    id,
                    slot.close.clone(),
                    Arc::clone(&self.table),
                    Arc::clone(&self.tunnel),
                )));
                port_tx.send_replace(Some(port));
                log::info!("forwarding 127.0.0.1:{port} -> {key}");
                Ok(true)
            }
            _ => {
                drop(listener);
                log::info!("forwarding {key}: cancelled during setup, closed 127.0.0.1:{port}");
                Ok(false)
            }
        }
    }

    /// Ensures forwarding exists and returns its local port.
    ///
    /// `Ok(None)` means forwarding was cancelled before the listener came up.
    /// The flag is `true` when this call created the listener.
    pub async fn forward_port(&self, key: &ForwardKey) -> Result<(Option<u16>, bool)> {
        let created = self.create_forwarding_server(key).await?;
        let Some(mut port_rx) = lock(&self.table).get(key).map(|slot| slot.port.clone()) else {
            return Ok((None, created));
        };
        let port = match port_rx.wait_for(Option::is_some).await {
            Ok(port) => *port,
            Err(_) => None,
        };
        Ok((port, created))
    }

    /// Removes `key` and closes its listener, waiting for closure.
    ///
    /// Returns `true` if anything was removed.
    pub async fn cancel_forward_port(&self, key: &ForwardKey) -> bool {
        let Some(slot) = lock(&self.table).remove(key) else {
            return false;
        };
        close_slot(key, slot).await;
        true
    }

    /// Currently bound local port for `key`.
    pub fn forwarded_port(&self, key: &ForwardKey) -> Option<u16> {
        lock(&self.table).get(key).and_then(|slot| *slot.port.borrow())
    }

    /// Closes every listener unconditionally.
    pub async fn close_all(&self) {
        let slots: Vec<(ForwardKey, Slot)> = lock(&self.table).drain().collect();
        for (key, slot) in slots {
            close_slot(&key, slot).await;
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_if_current(&self, key: &ForwardKey, id: u64) {
        let mut table = lock(&self.table);
        if table.get(key).is_some_and(|slot| slot.id == id) {
            table.remove(key);
        }
    }
}

async fn close_slot(key: &ForwardKey, slot: Slot) {
    slot.close.cancel();
    if let Some(task) = slot.task {
        if let Err(e) = task.await {
            log::warn!("forwarding {key}: listener task failed: {e}");
        }
    }
}

fn is_current(table: &Mutex<HashMap<ForwardKey, Slot>>, key: &ForwardKey, id: u64) -> bool {
    lock(table).get(key).is_some_and(|slot| slot.id == id)
}

/// Client disconnects surface as resets or broken pipes; they are not failures.
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

async fn serve<T: PodTunnel>(
    listener: TcpListener,
    key: ForwardKey,
    id: u64,
    close: CancellationToken,
    table: Table,
    tunnel: Arc<T>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    log::debug!("forwarding {key}: accepted {peer}");
                    connections.spawn(handle_connection(
                        conn,
                        key.clone(),
                        id,
                        close.clone(),
                        Arc::clone(&table),
                        Arc::clone(&tunnel),
                    ));
                }
                Err(e) => log::warn!("forwarding {key}: accept failed: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    connections.shutdown().await;
    log::info!("forwarding {key}: listener closed");
}

async fn handle_connection<T: PodTunnel>(
    conn: TcpStream,
    key: ForwardKey,
    id: u64,
    close: CancellationToken,
    table: Table,
    tunnel: Arc<T>,
) {
    let resolved = tokio::select! {
        _ = close.cancelled() => return,
        resolved = tunnel.resolve(&key) => resolved,
    };
    let target = match resolved {
        Ok(Some(target)) => target,
        Ok(None) => {
            log::warn!("forwarding {key}: no ready pod found, dropping connection");
            return;
        }
        Err(e) => {
            log::warn!("forwarding {key}: {e}, dropping connection");
            return;
        }
    };
    if !is_current(&table, &key, id) {
        log::warn!("forwarding {key}: forwarding was cancelled, dropping connection");
        return;
    }

    match tunnel.relay(&target, conn).await {
        Ok(()) => log::debug!("forwarding {key}: connection to {} closed", target.pod.name),
        Err(e) if is_benign(&e) => log::debug!("forwarding {key}: peer went away: {e}"),
        Err(e) => log::warn!("forwarding {key}: relay to {} failed: {e}", target.pod.name),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::k8s::PodReference;
    use futures::FutureExt;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::{mpsc, Notify};

    /// Relays to a local echo server instead of a pod.
    pub(crate) struct EchoTunnel {
        echo: SocketAddr,
        ready: bool,
        pub(crate) relays: AtomicUsize,
    }

    impl EchoTunnel {
        pub(crate) async fn start(ready: bool) -> Arc<Self> {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let echo = listener.local_addr().unwrap();
            tokio::spawn(async move {
                while let Ok((mut conn, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let (mut rd, mut wr) = conn.split();
                        let _ = tokio::io::copy(&mut rd, &mut wr).await;
                    });
                }
            });
            Arc::new(Self {
                echo,
                ready,
                relays: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PodTunnel for EchoTunnel {
        async fn resolve(&self, key: &ForwardKey) -> Result<Option<PodTarget>> {
            Ok(self.ready.then(|| PodTarget {
                pod: PodReference {
                    namespace: key.namespace.clone(),
                    name: format!("{}-0", key.endpoint),
                },
                port: key.port,
            }))
        }

        async fn relay(&self, _target: &PodTarget, mut conn: TcpStream) -> io::Result<()> {
            self.relays.fetch_add(1, Ordering::SeqCst);
            let mut upstream = TcpStream::connect(self.echo).await?;
            tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
            Ok(())
        }
    }

    fn key(endpoint: &str, port: u16) -> ForwardKey {
        ForwardKey::new(Some("apps"), endpoint, port)
    }

    #[tokio::test]
    async fn forwarding_twice_reuses_the_listener() {
        let forwards = PortForwards::new(EchoTunnel::start(true).await);

        let (first, created_first) = forwards.forward_port(&key("web", 80)).await.unwrap();
        let (second, created_second) = forwards.forward_port(&key("web", 80)).await.unwrap();

        assert!(first.is_some());
        assert_eq!(first, second);
        assert!(created_first);
        assert!(!created_second);
        assert_eq!(forwards.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_listener() {
        let forwards = Arc::new(PortForwards::new(EchoTunnel::start(true).await));
        let a = tokio::spawn({
            let forwards = Arc::clone(&forwards);
            async move { forwards.forward_port(&key("web", 80)).await.unwrap().0 }
        });
        let b = tokio::spawn({
            let forwards = Arc::clone(&forwards);
            async move { forwards.forward_port(&key("web", 80)).await.unwrap().0 }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(forwards.len(), 1);
    }

    #[tokio::test]
    async fn different_triples_get_different_listeners() {
        let forwards = PortForwards::new(EchoTunnel::start(true).await);
        let (a, _) = forwards.forward_port(&key("web", 80)).await.unwrap();
        let (b, _) = forwards.forward_port(&key("web", 443)).await.unwrap();
        let (c, _) = forwards
            .forward_port(&ForwardKey::new(Some("other"), "web", 80))
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(forwards.len(), 3);
    }

    #[tokio::test]
    async fn relays_bytes_to_the_pod() {
        let tunnel = EchoTunnel::start(true).await;
        let forwards = PortForwards::new(Arc::clone(&tunnel));
        let (port, _) = forwards.forward_port(&key("web", 80)).await.unwrap();

        let mut conn = TcpStream::connect((Ipv4Addr::LOCALHOST, port.unwrap())).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(tunnel.relays.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_dropped_without_ready_pod() {
        let tunnel = EchoTunnel::start(false).await;
        let forwards = PortForwards::new(Arc::clone(&tunnel));
        let (port, _) = forwards.forward_port(&key("web", 80)).await.unwrap();

        let mut conn = TcpStream::connect((Ipv4Addr::LOCALHOST, port.unwrap())).await.unwrap();
        let mut buf = Vec::new();
        let read = conn.read_to_end(&mut buf).await;
        assert!(read.map(|n| n == 0).unwrap_or(true));
        assert_eq!(tunnel.relays.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_closes_the_listener() {
        let forwards = PortForwards::new(EchoTunnel::start(true).await);
        let k = key("web", 80);
        let (port, _) = forwards.forward_port(&k).await.unwrap();
        let port = port.unwrap();

        assert!(forwards.cancel_forward_port(&k).await);
        assert_eq!(forwards.forwarded_port(&k), None);
        assert!(forwards.is_empty());
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn cancel_without_forward_is_noop() {
        let forwards = PortForwards::new(EchoTunnel::start(true).await);
        assert!(!forwards.cancel_forward_port(&key("web", 80)).await);
    }

    #[tokio::test]
    async fn close_all_empties_the_table() {
        let forwards = PortForwards::new(EchoTunnel::start(true).await);
        forwards.forward_port(&key("web", 80)).await.unwrap();
        forwards.forward_port(&key("db", 5432)).await.unwrap();
        forwards.close_all().await;
        assert!(forwards.is_empty());
        assert_eq!(forwards.forwarded_port(&key("db", 5432)), None);
    }

    /// Pauses setup after bind; returns the bound port and a resume handle.
    fn pause_after_bind(forwards: &mut PortForwards<EchoTunnel>) -> (mpsc::UnboundedReceiver<u16>, Arc<Notify>) {
        let (bound_tx, bound_rx) = mpsc::unbounded_channel();
        let resume = Arc::new(Notify::new());
        let gate = Arc::clone(&resume);
        forwards.after_bind = Some(Arc::new(move |port: u16| {
            let _ = bound_tx.send(port);
            let gate = Arc::clone(&gate);
            async move { gate.notified().await }.boxed()
        }));
        (bound_rx, resume)
    }

    #[tokio::test]
    async fn cancel_during_setup_closes_the_new_listener() {
        let mut forwards = PortForwards::new(EchoTunnel::start(true).await);
        let (mut bound, resume) = pause_after_bind(&mut forwards);
        let forwards = Arc::new(forwards);

        let setup = tokio::spawn({
            let forwards = Arc::clone(&forwards);
            async move { forwards.forward_port(&key("web", 80)).await.unwrap() }
        });
        let port = bound.recv().await.unwrap();

        assert!(forwards.cancel_forward_port(&key("web", 80)).await);
        resume.notify_one();

        assert_eq!(setup.await.unwrap(), (None, false));
        assert!(forwards.is_empty());
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_during_setup_leaves_no_listener() {
        let shutdown = CancellationToken::new();
        let mut forwards = PortForwards::with_shutdown(EchoTunnel::start(true).await, shutdown.clone());
        let (mut bound, resume) = pause_after_bind(&mut forwards);
        let forwards = Arc::new(forwards);

        let setup = tokio::spawn({
            let forwards = Arc::clone(&forwards);
            async move { forwards.forward_port(&key("web", 80)).await.unwrap() }
        });
        let port = bound.recv().await.unwrap();

        shutdown.cancel();
        resume.notify_one();

        assert_eq!(setup.await.unwrap(), (None, false));
        assert!(forwards.is_empty());
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn nothing_is_registered_after_shutdown() {
        let shutdown = CancellationToken::new();
        let forwards = PortForwards::with_shutdown(EchoTunnel::start(true).await, shutdown.clone());
        shutdown.cancel();

        assert_eq!(forwards.forward_port(&key("web", 80)).await.unwrap(), (None, false));
        assert!(forwards.is_empty());
    }

    #[test]
    fn resets_and_broken_pipes_are_benign() {
        assert!(is_benign(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_benign(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_benign(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
