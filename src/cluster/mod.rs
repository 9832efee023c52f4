//! # Assignment publisher
//!
//! Watches the cluster and decides which nodes back each service.
//!
//! ```text
//!  ┌──────────────┐   ┌──────────────┐   ┌────────────────────┐
//!  │ Cluster API  │──▶│ HostSelector │──▶│ AssignmentPublisher│──▶ load balancers
//!  │ (snapshot)   │   │ (≤ K hosts)  │   │ (concurrent POSTs) │    (POST /update)
//!  └──────────────┘   └──────────────┘   └────────────────────┘
//! ```
//!
//! One cycle every poll interval: list services and nodes, pick up to K
//! candidate hosts per service, push the full map to every target.

pub mod assignment;
pub mod poller;
pub mod provider;
pub mod publisher;
pub mod selector;
pub mod service;

pub use assignment::{build_assignments, Assignment, AssignmentMap, ClusterSnapshot};
pub use poller::{CycleReport, Poller, PollerConfig, DEFAULT_POLL_INTERVAL_SECS};
pub use provider::{ClusterSnapshotProvider, KubeSnapshotProvider, LabelFilters, ProviderError};
pub use publisher::{
    AssignmentPublisher, Delivered, DeliveryOutcome, LoadBalancerTarget, PublishError,
    DEFAULT_TARGET_TIMEOUT_SECS,
};
pub use selector::{HostSelector, DEFAULT_HOST_LIMIT};
pub use service::{
    service_key, NodeDescriptor, NodeSet, Protocol, ServiceDescriptor, ServicePort,
};
