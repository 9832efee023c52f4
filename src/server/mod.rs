//! HTTP surface of the load balancer agent

pub mod handlers;
pub mod state;

pub use handlers::create_router;
pub use state::{PassError, PassSummary, ReconcilerState};
