//! Service watch cache and the flattened service list built from it.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::k8s::{ForwardKey, ServiceEntry, DEFAULT_NAMESPACE};

/// Flattens each service's declared ports into [`ServiceEntry`] records.
///
/// `namespace` filters services (a service without a namespace counts as
/// `default`). `forwarded` reports the local port of an active forward for a key.
pub fn flatten_services<'a, I, F>(services: I, namespace: Option<&str>, forwarded: F) -> Vec<ServiceEntry>
where
    I: IntoIterator<Item = &'a Service>,
    F: Fn(&ForwardKey) -> Option<u16>,
{
    let mut entries = Vec::new();

    for service in services {
        let Some(name) = service.metadata.name.as_deref() else {
            continue;
        };
        let service_ns = service.metadata.namespace.as_deref();
        if let Some(wanted) = namespace {
            if service_ns.unwrap_or(DEFAULT_NAMESPACE) != wanted {
                continue;
            }
        }

        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default();

        for declared in ports {
            let port = u16::try_from(declared.port).ok();
            let listen_port = port.and_then(|p| forwarded(&ForwardKey::new(service_ns, name, p)));
            entries.push(ServiceEntry {
                namespace: service_ns.map(str::to_string),
                name: name.to_string(),
                port_name: declared.name.clone(),
                port,
                listen_port,
            });
        }
    }

    entries.sort_by(|a, b| {
        (a.namespace.as_deref(), a.name.as_str(), a.port).cmp(&(b.namespace.as_deref(), b.name.as_str(), b.port))
    });
    entries
}

/// Opens a list-and-watch over Services in all namespaces.
///
/// The returned store is the watch cache; `on_change` runs once the initial
/// list completes and after every add/modify/delete, in stream order.
pub fn spawn_watch<F>(client: kube::Client, shutdown: CancellationToken, on_change: F) -> (Store<Service>, JoinHandle<()>)
where
    F: Fn() + Send + 'static,
{
    let api: Api<Service> = Api::all(client);
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);

    let task = tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if is_change(&event) {
                        on_change();
                    }
                }
                Some(Err(e)) => log::warn!("service watch: {e}"),
                None => {
                    log::info!("service watch: stream ended");
                    break;
                }
            }
        }
        log::debug!("service watch: stopped");
    });

    (reader, task)
}

fn is_change(event: &watcher::Event<Service>) -> bool {
    matches!(
        event,
        watcher::Event::Apply(_) | watcher::Event::Delete(_) | watcher::Event::InitDone
    )
}
