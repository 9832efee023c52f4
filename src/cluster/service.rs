//! Service and node resources as observed from the cluster
//!
//! These types are rebuilt on every poll cycle from the cluster snapshot and
//! are never mutated in place, except for the per-cycle load counter on
//! [`NodeDescriptor`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport protocol of a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP", alias = "tcp")]
    Tcp,
    #[serde(rename = "UDP", alias = "udp")]
    Udp,
}

impl Protocol {
    /// Datagram protocols need the listener and upstream marked as such
    pub fn is_datagram(&self) -> bool {
        matches!(self, Protocol::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exposed port of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub protocol: Protocol,

    /// Port the virtual address listens on
    #[serde(rename = "nativePort")]
    pub external_port: u16,

    /// Port every backend node exposes the service on
    #[serde(rename = "nodePort")]
    pub node_port: u16,
}

impl ServicePort {
    pub fn tcp(external_port: u16, node_port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            external_port,
            node_port,
        }
    }

    pub fn udp(external_port: u16, node_port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            external_port,
            node_port,
        }
    }
}

/// A namespaced service discovered from the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: ServicePort) -> Self {
        self.ports.push(port);
        self
    }

    /// Identity key, unique across namespaces
    pub fn key(&self) -> String {
        service_key(&self.name, &self.namespace)
    }
}

/// Build the `name.namespace` identity key
pub fn service_key(name: &str, namespace: &str) -> String {
    format!("{}.{}", name, namespace)
}

/// A cluster machine eligible to receive backend traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeDescriptor {
    pub hostname: String,

    /// Number of services that picked this node during the current cycle
    #[serde(rename = "assignedServiceCount")]
    pub assigned_service_count: u32,
}

impl NodeDescriptor {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            assigned_service_count: 0,
        }
    }
}

/// Nodes of one cycle, indexed by hostname
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    nodes: BTreeMap<String, NodeDescriptor>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node; a hostname seen twice is kept once
    pub fn insert(&mut self, hostname: impl Into<String>) {
        let hostname = hostname.into();
        self.nodes
            .entry(hostname.clone())
            .or_insert_with(|| NodeDescriptor::new(hostname));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn get(&self, hostname: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(hostname)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// Record that one more service picked `hostname`
    pub fn record_assignment(&mut self, hostname: &str) {
        if let Some(node) = self.nodes.get_mut(hostname) {
            node.assigned_service_count += 1;
        }
    }

    /// Zero every load counter, done at the start of each cycle
    pub fn reset_counts(&mut self) {
        for node in self.nodes.values_mut() {
            node.assigned_service_count = 0;
        }
    }
}

impl<S: Into<String>> FromIterator<S> for NodeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = NodeSet::new();
        for hostname in iter {
            set.insert(hostname);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_key() {
        let svc = ServiceDescriptor::new("web", "default");
        assert_eq!(svc.key(), "web.default");
    }

    #[test]
    fn test_keys_differ_across_namespaces() {
        let a = ServiceDescriptor::new("web", "prod");
        let b = ServiceDescriptor::new("web", "staging");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_port_wire_names() {
        let port = ServicePort::udp(53, 30053);
        let json = serde_json::to_value(port).unwrap();
        assert_eq!(json["protocol"], "UDP");
        assert_eq!(json["nativePort"], 53);
        assert_eq!(json["nodePort"], 30053);
    }

    #[test]
    fn test_protocol_accepts_lowercase() {
        let port: ServicePort =
            serde_json::from_str(r#"{"protocol":"tcp","nativePort":80,"nodePort":31000}"#)
                .unwrap();
        assert_eq!(port, ServicePort::tcp(80, 31000));
    }

    #[test]
    fn test_node_set_dedupes_and_counts() {
        let mut nodes: NodeSet = ["a", "b", "a"].into_iter().collect();
        assert_eq!(nodes.len(), 2);

        nodes.record_assignment("a");
        nodes.record_assignment("a");
        nodes.record_assignment("missing");
        assert_eq!(nodes.get("a").unwrap().assigned_service_count, 2);
        assert_eq!(nodes.get("b").unwrap().assigned_service_count, 0);

        nodes.reset_counts();
        assert!(nodes.iter().all(|n| n.assigned_service_count == 0));
    }
}
