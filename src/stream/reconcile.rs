//! Reconciliation of desired services against the address pool
//!
//! A pass runs in three strictly ordered phases over state owned by the pass
//! itself:
//!
//! 1. **match**: services that already hold an address are re-rendered and
//!    rewritten only if their content hash moved (`NoChange` / `Changed`)
//! 2. **free**: allocations no longer desired are deleted and their
//!    addresses return to the open set
//! 3. **assign**: the remaining services take open addresses in configured
//!    order until the pool runs out (`Created` / `Cannot Assign IP`)
//!
//! Artifact I/O failures stay attached to the service they happened on; the
//! pass always continues with the next service.

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::artifact::{artifact_id, validate_service_key, ArtifactError, ArtifactStore};
use super::pool::{read_state, AddressPool, AddressState, PoolState};
use super::render::render;
use crate::cluster::assignment::{Assignment, AssignmentMap};

/// Address reported for services that did not get one
pub const NO_ADDRESS: &str = "none";

/// Outcome of one service in one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    Created,
    Changed,
    NoChange,
    #[serde(rename = "Cannot Assign IP")]
    CannotAssign,
    #[serde(rename = "Error")]
    Failed,
}

/// Per-service entry of the pass report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub service: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    pub status: Disposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReconcileResult {
    fn new(service: &str, address: Option<IpAddr>, status: Disposition) -> Self {
        Self {
            service: service.to_string(),
            ip_address: address
                .map(|a| a.to_string())
                .unwrap_or_else(|| NO_ADDRESS.to_string()),
            status,
            error: None,
        }
    }

    fn failed(service: &str, address: Option<IpAddr>, reason: impl ToString) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::new(service, address, Disposition::Failed)
        }
    }
}

/// Failures that prevent a pass from running at all
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Cannot read current allocation state: {0}")]
    State(#[from] ArtifactError),
}

/// Everything a pass produced
#[derive(Debug, Clone)]
pub struct PassOutcome {
    /// Results for every desired service, match phase first
    pub results: Vec<ReconcileResult>,
    /// Services whose allocation was released
    pub freed: Vec<String>,
    /// Pool state at the end of the pass
    pub pool: AddressPool,
}

impl PassOutcome {
    pub fn count(&self, status: Disposition) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Reconciles desired services into artifacts on one store
pub struct Reconciler<S> {
    store: S,
    addresses: Vec<IpAddr>,
}

impl<S: ArtifactStore> Reconciler<S> {
    pub fn new(store: S, addresses: Vec<IpAddr>) -> Self {
        Self { store, addresses }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Run one complete pass for `desired`
    pub fn reconcile(&self, desired: &AssignmentMap) -> Result<PassOutcome, ReconcileError> {
        let PoolState {
            mut pool,
            mut index,
            present: mut taken,
        } = read_state(&self.addresses, &self.store)?;
        debug!(
            desired = desired.len(),
            allocated = index.len(),
            open = pool.open_addresses().len(),
            "Starting reconciliation pass"
        );

        let mut results = Vec::with_capacity(desired.len());
        let mut unmatched = Vec::new();

        for (key, assignment) in desired {
            if let Err(reason) = validate_service_key(key) {
                warn!(service = %key, reason = %reason, "Rejecting service");
                results.push(ReconcileResult::failed(key, None, reason));
                continue;
            }
            match index.remove(key) {
                Some(address) => results.push(self.refresh(&mut pool, key, address, assignment)),
                None => unmatched.push((key, assignment)),
            }
        }

        let mut freed = Vec::new();
        for (key, address) in index {
            if let Some(artifact) = self.release(&mut pool, &key, address) {
                taken.remove(&artifact);
                freed.push(key);
            }
        }

        let mut open = pool.open_addresses().into_iter().peekable();
        for (key, assignment) in unmatched {
            let Some(&address) = open.peek() else {
                warn!(service = %key, "Too many services, not enough addresses");
                results.push(ReconcileResult::new(key, None, Disposition::CannotAssign));
                continue;
            };
            let result = self.create(&mut pool, &mut taken, key, address, assignment);
            if result.status == Disposition::Created {
                open.next();
            }
            results.push(result);
        }

        let outcome = PassOutcome {
            results,
            freed,
            pool,
        };
        info!(
            created = outcome.count(Disposition::Created),
            changed = outcome.count(Disposition::Changed),
            unchanged = outcome.count(Disposition::NoChange),
            rejected = outcome.count(Disposition::CannotAssign),
            failed = outcome.count(Disposition::Failed),
            freed = outcome.freed.len(),
            "Reconciliation pass complete"
        );
        Ok(outcome)
    }

    /// Match phase for a service that already holds `address`
    fn refresh(
        &self,
        pool: &mut AddressPool,
        key: &str,
        address: IpAddr,
        assignment: &Assignment,
    ) -> ReconcileResult {
        let Some((current_hash, artifact)) = pool.get(address).and_then(|va| match &va.state {
            AddressState::Allocated {
                content_hash,
                artifact,
                ..
            } => Some((content_hash.clone(), artifact.clone())),
            AddressState::Open => None,
        }) else {
            return ReconcileResult::failed(key, Some(address), "allocation disappeared");
        };

        let rendered = render(key, address, &assignment.service.ports, &assignment.hosts);
        if rendered.hash == current_hash {
            debug!(service = %key, %address, "Configuration unchanged");
            return ReconcileResult::new(key, Some(address), Disposition::NoChange);
        }

        match self.store.write(&artifact, &rendered.text) {
            Ok(()) => {
                pool.update_hash(address, rendered.hash);
                info!(service = %key, %address, artifact = %artifact, "Configuration changed, artifact rewritten");
                ReconcileResult::new(key, Some(address), Disposition::Changed)
            }
            Err(e) => {
                error!(service = %key, %address, error = %e, "Failed to rewrite artifact");
                ReconcileResult::failed(key, Some(address), e)
            }
        }
    }

    /// Free phase: delete the artifact and reopen the address.
    ///
    /// If the artifact cannot be deleted the address stays allocated, so it
    /// is never handed to another service while the old file is live.
    /// Returns the deleted artifact id.
    fn release(&self, pool: &mut AddressPool, key: &str, address: IpAddr) -> Option<String> {
        let Some(AddressState::Allocated { artifact, .. }) =
            pool.get(address).map(|va| va.state.clone())
        else {
            return None;
        };

        match self.store.remove(&artifact) {
            Ok(()) => {
                info!(service = %key, %address, artifact = %artifact, "Service no longer desired, address freed");
                pool.release(address);
                Some(artifact)
            }
            Err(e) => {
                error!(service = %key, %address, error = %e, "Failed to delete artifact, keeping address reserved");
                None
            }
        }
    }

    /// Assign phase: render and store a new artifact on `address`.
    ///
    /// Never writes over an id in `taken`: those files belong to another
    /// allocation, an orphan, or someone else entirely.
    fn create(
        &self,
        pool: &mut AddressPool,
        taken: &mut BTreeSet<String>,
        key: &str,
        address: IpAddr,
        assignment: &Assignment,
    ) -> ReconcileResult {
        let Some(artifact) = [artifact_id(key), artifact_id(&format!("{}@{}", key, address))]
            .into_iter()
            .find(|id| !taken.contains(id))
        else {
            warn!(service = %key, %address, "No free artifact name, existing files are left alone");
            return ReconcileResult::failed(key, None, "artifact name already in use");
        };

        let rendered = render(key, address, &assignment.service.ports, &assignment.hosts);
        match self.store.write(&artifact, &rendered.text) {
            Ok(()) => {
                taken.insert(artifact.clone());
                pool.allocate(address, key, rendered.hash, &artifact);
                info!(service = %key, %address, artifact = %artifact, "Service assigned");
                ReconcileResult::new(key, Some(address), Disposition::Created)
            }
            Err(e) => {
                error!(service = %key, %address, error = %e, "Failed to write artifact");
                ReconcileResult::failed(key, None, e)
            }
        }
    }
}
