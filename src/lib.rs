//! flipbit: spreads cluster services over a pool of load balancer addresses
//!
//! Two halves share this crate:
//!
//! - [`cluster`] runs next to the cluster API. It lists services and nodes,
//!   picks a bounded set of backend hosts per service and publishes the
//!   resulting map to every load balancer agent.
//! - [`stream`] and [`server`] run on each load balancer. They accept the map,
//!   bind every service to one virtual address and keep the proxy's stream
//!   configuration in step with it.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod server;
pub mod stream;
