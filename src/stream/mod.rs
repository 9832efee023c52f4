//! Stream reconciliation for the proxy side
//!
//! Receives the desired service → hosts map from the core and turns it into
//! one proxy configuration artifact per service, each bound to one virtual
//! address out of a fixed pool.
//!
//! ```text
//! AssignmentMap ──► Reconciler ──► render ──► ArtifactStore (directory)
//!                       ▲                          │
//!                       └──── read_state ◄─────────┘
//! ```
//!
//! The artifact directory is the only persistent state. Every pass rebuilds
//! the pool from the marker lines at the top of each artifact.

pub mod artifact;
pub mod pool;
pub mod reconcile;
pub mod render;

#[cfg(test)]
pub(crate) mod testing;

pub use artifact::{
    artifact_id, validate_service_key, ArtifactError, ArtifactHeader, ArtifactStore,
    DirectoryStore, HeaderError,
};
pub use pool::{read_state, AddressPool, AddressState, PoolState, VirtualAddress};
pub use reconcile::{
    Disposition, PassOutcome, ReconcileError, ReconcileResult, Reconciler, NO_ADDRESS,
};
pub use render::{content_hash, render, RenderedConfig};
