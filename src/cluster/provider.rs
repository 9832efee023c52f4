//! Cluster snapshot retrieval
//!
//! The poll loop only depends on [`ClusterSnapshotProvider`]; the Kubernetes
//! implementation lists services and nodes through the API server.

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::assignment::ClusterSnapshot;
use super::service::{NodeSet, Protocol, ServiceDescriptor, ServicePort};
use crate::config::ClusterAuth;

/// Label carrying a node's hostname
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

const CONTEXT_NAME: &str = "flipbit";

/// Errors reaching or reading the cluster API
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("In-cluster configuration unavailable: {0}")]
    InCluster(#[from] kube::config::InClusterError),

    #[error("Invalid cluster credentials: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("Failed to build cluster configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("Cluster API error: {0}")]
    Api(#[from] kube::Error),
}

/// Source of services and nodes for one poll cycle
#[async_trait]
pub trait ClusterSnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> Result<ClusterSnapshot, ProviderError>;
}

/// Optional `<label>=true` filters for listings
#[derive(Debug, Clone, Default)]
pub struct LabelFilters {
    pub service_label: Option<String>,
    pub node_label: Option<String>,
}

fn list_params(label: Option<&str>) -> ListParams {
    match label {
        Some(label) => ListParams::default().labels(&format!("{}=true", label)),
        None => ListParams::default(),
    }
}

/// Lists services and nodes from a Kubernetes API server
#[derive(Clone)]
pub struct KubeSnapshotProvider {
    client: Client,
    filters: LabelFilters,
}

impl KubeSnapshotProvider {
    pub fn new(client: Client, filters: LabelFilters) -> Self {
        Self { client, filters }
    }

    /// Build a client for the configured connection mode and check that the
    /// API server answers
    pub async fn connect(auth: &ClusterAuth, filters: LabelFilters) -> Result<Self, ProviderError> {
        let config = match kubeconfig_for(auth)? {
            Some(kubeconfig) => {
                info!(api_server = ?auth.api_server(), "Using explicit cluster credentials");
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => {
                info!("Using in-cluster service account");
                Config::incluster()?
            }
        };
        let client = Client::try_from(config)?;
        let version = client.apiserver_version().await?;
        info!(version = %version.git_version, "Connected to cluster API");
        Ok(Self::new(client, filters))
    }
}

#[async_trait]
impl ClusterSnapshotProvider for KubeSnapshotProvider {
    async fn snapshot(&self) -> Result<ClusterSnapshot, ProviderError> {
        let services: Api<Service> = Api::all(self.client.clone());
        let nodes: Api<Node> = Api::all(self.client.clone());

        let service_list = services
            .list(&list_params(self.filters.service_label.as_deref()))
            .await?;
        let node_list = nodes
            .list(&list_params(self.filters.node_label.as_deref()))
            .await?;

        debug!(
            services = service_list.items.len(),
            nodes = node_list.items.len(),
            "Listed cluster state"
        );

        Ok(ClusterSnapshot {
            services: service_list.items.iter().filter_map(service_from_k8s).collect(),
            nodes: node_list.items.iter().filter_map(hostname_from_k8s).collect::<NodeSet>(),
        })
    }
}

/// Build a single-context kubeconfig for token or basic auth
fn kubeconfig_for(auth: &ClusterAuth) -> Result<Option<Kubeconfig>, ProviderError> {
    let (api_server, ca_data, user) = match auth {
        ClusterAuth::InCluster => return Ok(None),
        ClusterAuth::Token {
            api_server,
            token,
            ca_data,
        } => (api_server, ca_data, json!({ "token": token })),
        ClusterAuth::Basic {
            api_server,
            username,
            password,
            ca_data,
        } => (
            api_server,
            ca_data,
            json!({ "username": username, "password": password }),
        ),
    };

    let mut cluster = json!({ "server": api_server });
    if let Some(ca) = ca_data {
        cluster["certificate-authority-data"] =
            json!(base64::engine::general_purpose::STANDARD.encode(ca.as_bytes()));
    }

    let kubeconfig = serde_json::from_value(json!({
        "clusters": [{ "name": CONTEXT_NAME, "cluster": cluster }],
        "users": [{ "name": CONTEXT_NAME, "user": user }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": { "cluster": CONTEXT_NAME, "user": CONTEXT_NAME }
        }],
        "current-context": CONTEXT_NAME,
    }))?;
    Ok(Some(kubeconfig))
}

/// Convert a Kubernetes service, keeping only ports reachable on a node port
pub fn service_from_k8s(service: &Service) -> Option<ServiceDescriptor> {
    let name = service.metadata.name.clone()?;
    let namespace = service
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let mut descriptor = ServiceDescriptor::new(name, namespace);
    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    for port in ports {
        let protocol = match port.protocol.as_deref() {
            None | Some("TCP") => Protocol::Tcp,
            Some("UDP") => Protocol::Udp,
            Some(other) => {
                warn!(
                    service = %descriptor.key(),
                    protocol = other,
                    "Skipping port with unsupported protocol"
                );
                continue;
            }
        };
        let Some(node_port) = port.node_port.and_then(|p| u16::try_from(p).ok()) else {
            continue;
        };
        let Ok(external_port) = u16::try_from(port.port) else {
            continue;
        };
        descriptor.ports.push(ServicePort {
            protocol,
            external_port,
            node_port,
        });
    }

    Some(descriptor)
}

/// Hostname label of a node, falling back to its object name
pub fn hostname_from_k8s(node: &Node) -> Option<String> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(HOSTNAME_LABEL))
        .cloned()
        .or_else(|| node.metadata.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k8s_service(value: serde_json::Value) -> Service {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_service_conversion() {
        let svc = k8s_service(json!({
            "metadata": {"name": "web", "namespace": "shop"},
            "spec": {"type": "NodePort", "ports": [
                {"port": 80, "nodePort": 31000, "protocol": "TCP"},
                {"port": 53, "nodePort": 30053, "protocol": "UDP"},
                {"port": 9000}
            ]}
        }));

        let descriptor = service_from_k8s(&svc).unwrap();

        assert_eq!(descriptor.key(), "web.shop");
        assert_eq!(
            descriptor.ports,
            vec![ServicePort::tcp(80, 31000), ServicePort::udp(53, 30053)]
        );
    }

    #[test]
    fn test_unsupported_protocol_is_skipped() {
        let svc = k8s_service(json!({
            "metadata": {"name": "sig", "namespace": "tel"},
            "spec": {"ports": [{"port": 5060, "nodePort": 30060, "protocol": "SCTP"}]}
        }));

        let descriptor = service_from_k8s(&svc).unwrap();
        assert!(descriptor.ports.is_empty());
    }

    #[test]
    fn test_service_without_spec() {
        let svc = k8s_service(json!({"metadata": {"name": "bare"}}));
        let descriptor = service_from_k8s(&svc).unwrap();
        assert_eq!(descriptor.key(), "bare.default");
        assert!(descriptor.ports.is_empty());
    }

    #[test]
    fn test_hostname_prefers_label() {
        let labelled: Node = serde_json::from_value(json!({
            "metadata": {"name": "node-1", "labels": {"kubernetes.io/hostname": "worker-a"}}
        }))
        .unwrap();
        let unlabelled: Node =
            serde_json::from_value(json!({"metadata": {"name": "node-2"}})).unwrap();

        assert_eq!(hostname_from_k8s(&labelled).as_deref(), Some("worker-a"));
        assert_eq!(hostname_from_k8s(&unlabelled).as_deref(), Some("node-2"));
    }

    #[test]
    fn test_token_kubeconfig() {
        let auth = ClusterAuth::Token {
            api_server: "https://10.0.0.1:6443".to_string(),
            token: "abc".to_string(),
            ca_data: Some("-----BEGIN CERTIFICATE-----".to_string()),
        };

        let kubeconfig = kubeconfig_for(&auth).unwrap().unwrap();

        assert_eq!(kubeconfig.current_context.as_deref(), Some(CONTEXT_NAME));
        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(kubeconfig.auth_infos.len(), 1);
    }

    #[test]
    fn test_in_cluster_needs_no_kubeconfig() {
        assert!(kubeconfig_for(&ClusterAuth::InCluster).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_fails_when_api_unreachable() {
        let auth = ClusterAuth::Token {
            api_server: "http://127.0.0.1:9".to_string(),
            token: "t".to_string(),
            ca_data: None,
        };

        let result = KubeSnapshotProvider::connect(&auth, LabelFilters::default()).await;

        assert!(matches!(result, Err(ProviderError::Api(_))));
    }
}
