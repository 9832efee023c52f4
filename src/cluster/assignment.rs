//! Service to host assignments
//!
//! One [`Assignment`] is produced per service per cycle. The whole map is the
//! unit pushed to every load balancer, keyed by `name.namespace`.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::selector::HostSelector;
use super::service::{NodeSet, ServiceDescriptor};

/// Hosts chosen to back one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(flatten)]
    pub service: ServiceDescriptor,

    #[serde(default)]
    pub hosts: Vec<String>,
}

impl Assignment {
    pub fn new(service: ServiceDescriptor, hosts: Vec<String>) -> Self {
        Self { service, hosts }
    }

    pub fn key(&self) -> String {
        self.service.key()
    }
}

/// Full assignment set for one cycle, as sent on the wire
pub type AssignmentMap = BTreeMap<String, Assignment>;

/// Services and nodes listed from the cluster in one cycle
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub services: Vec<ServiceDescriptor>,
    pub nodes: NodeSet,
}

/// Select hosts for every service in the snapshot.
///
/// Node counters are reset first, so after this call they describe only
/// the current cycle.
pub fn build_assignments<R: Rng>(
    snapshot: &mut ClusterSnapshot,
    selector: &HostSelector,
    rng: &mut R,
) -> AssignmentMap {
    snapshot.nodes.reset_counts();

    let mut assignments = AssignmentMap::new();
    for service in &snapshot.services {
        if service.ports.is_empty() {
            debug!(service = %service.key(), "Skipping service without node ports");
            continue;
        }

        let hosts = selector.select(&mut snapshot.nodes, rng);
        let assignment = Assignment::new(service.clone(), hosts);
        assignments.insert(assignment.key(), assignment);
    }
    assignments
}

/// Log the assignment table and how the cycle spread services across nodes
pub fn log_cycle_summary(assignments: &AssignmentMap, nodes: &NodeSet) {
    info!(
        services = assignments.len(),
        nodes = nodes.len(),
        "Computed service assignments"
    );
    for (key, assignment) in assignments {
        let ports = assignment
            .service
            .ports
            .iter()
            .map(|p| format!("{}:{}/{}", p.node_port, p.external_port, p.protocol))
            .collect::<Vec<_>>()
            .join(", ");
        debug!(
            service = %key,
            ports = %ports,
            hosts = %assignment.hosts.join(", "),
            "Service assignment"
        );
    }
    for node in nodes.iter() {
        debug!(
            hostname = %node.hostname,
            services = node.assigned_service_count,
            "Node load"
        );
    }
}
