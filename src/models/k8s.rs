// Rust structs mirroring the service and forwarding records handed to the UI layer
use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace assumed when a Service or forward request does not carry one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// One (service, port) pair flattened out of a watched Service object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub namespace: Option<String>,
    pub name: String,
    pub port_name: Option<String>,
    /// Port declared on the Service (inside the cluster)
    pub port: Option<u16>,
    /// Loopback port on the host, present only while a forward is active
    pub listen_port: Option<u16>,
}

/// Composite key of the forwarding table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForwardKey {
    pub namespace: String,
    pub endpoint: String,
    pub port: u16,
}

impl ForwardKey {
    pub fn new(namespace: Option<&str>, endpoint: &str, port: u16) -> Self {
        let namespace = match namespace {
            Some(ns) if !ns.is_empty() => ns,
            _ => DEFAULT_NAMESPACE,
        };
        Self {
            namespace: namespace.to_string(),
            endpoint: endpoint.to_string(),
            port,
        }
    }
}

impl fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.endpoint, self.port)
    }
}

/// A ready pod backing an endpoint. Recomputed for every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodReference {
    pub namespace: String,
    pub name: String,
}

/// Where a proxied connection is relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub pod: PodReference,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_key_defaults_namespace() {
        assert_eq!(ForwardKey::new(None, "web", 80).namespace, "default");
        assert_eq!(ForwardKey::new(Some(""), "web", 80).namespace, "default");
        assert_eq!(ForwardKey::new(Some("kube-system"), "dns", 53).namespace, "kube-system");
    }

    #[test]
    fn forward_key_display() {
        let key = ForwardKey::new(Some("apps"), "web", 8080);
        assert_eq!(key.to_string(), "apps/web:8080");
    }

    #[test]
    fn service_entry_serializes_camel_case() {
        let entry = ServiceEntry {
            namespace: Some("default".into()),
            name: "web".into(),
            port_name: Some("http".into()),
            port: Some(80),
            listen_port: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["portName"], "http");
        assert!(json["listenPort"].is_null());
    }
}
