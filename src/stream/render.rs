//! Proxy stream configuration generation
//!
//! Pure functions: the same service, address, ports and upstream set always
//! produce byte-identical text, which is what makes the content hash usable
//! for drift detection.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use sha2::{Digest, Sha256};

use super::artifact::ArtifactHeader;
use crate::cluster::service::ServicePort;

/// Rendered configuration and its fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub text: String,
    pub hash: String,
}

/// Render the configuration for one service on one virtual address.
///
/// Upstream hosts are sorted and de-duplicated so the same host set always
/// renders the same way regardless of selection order.
pub fn render(
    service_key: &str,
    address: IpAddr,
    ports: &[ServicePort],
    upstreams: &[String],
) -> RenderedConfig {
    let mut hosts: Vec<&str> = upstreams.iter().map(String::as_str).collect();
    hosts.sort_unstable();
    hosts.dedup();

    let mut text = ArtifactHeader {
        address,
        service: service_key.to_string(),
    }
    .to_string();

    for port in ports {
        let group = upstream_group_name(service_key, port);
        let datagram = if port.protocol.is_datagram() { " udp" } else { "" };

        text.push_str(&format!("upstream {} {{\n", group));
        text.push_str("    least_conn;\n");
        for host in &hosts {
            text.push_str(&format!(
                "    server {}:{}{};\n",
                bracket_ipv6(host),
                port.node_port,
                datagram
            ));
        }
        text.push_str("}\n");
        text.push_str("server {\n");
        text.push_str(&format!(
            "    listen {}{};\n",
            SocketAddr::new(address, port.external_port),
            datagram
        ));
        text.push_str(&format!("    proxy_pass {};\n", group));
        text.push_str("}\n");
    }

    let hash = content_hash(&text);
    RenderedConfig { text, hash }
}

/// SHA-256 of `content`, lowercase hex
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn upstream_group_name(service_key: &str, port: &ServicePort) -> String {
    format!(
        "{}_{}_{}_origin",
        service_key, port.external_port, port.protocol
    )
}

fn bracket_ipv6(host: &str) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}
