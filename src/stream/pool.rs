//! Virtual address pool and its reconstruction from disk
//!
//! The pool is fixed at startup from the configured address list. Which
//! service holds which address is never persisted separately: it is read
//! back from the artifacts the previous pass left behind.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, warn};

use super::artifact::{ArtifactError, ArtifactHeader, ArtifactStore};
use super::render::content_hash;

/// Allocation state of one virtual address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum AddressState {
    Open,
    #[serde(rename_all = "camelCase")]
    Allocated {
        service: String,
        /// Hash of the artifact content currently backing this address
        content_hash: String,
        /// Identifier of the backing artifact
        artifact: String,
    },
}

/// One externally routable address the proxy can listen on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualAddress {
    pub address: IpAddr,
    #[serde(flatten)]
    pub state: AddressState,
}

impl VirtualAddress {
    pub fn is_open(&self) -> bool {
        matches!(self.state, AddressState::Open)
    }

    pub fn occupant(&self) -> Option<&str> {
        match &self.state {
            AddressState::Allocated { service, .. } => Some(service),
            AddressState::Open => None,
        }
    }
}

/// The fixed set of virtual addresses, in configured order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AddressPool {
    addresses: Vec<VirtualAddress>,
}

impl AddressPool {
    /// Build an all-open pool; repeated addresses are kept once
    pub fn new(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut pool = Self::default();
        for address in addresses {
            if !pool.contains(address) {
                pool.addresses.push(VirtualAddress {
                    address,
                    state: AddressState::Open,
                });
            }
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        self.get(address).is_some()
    }

    pub fn get(&self, address: IpAddr) -> Option<&VirtualAddress> {
        self.addresses.iter().find(|va| va.address == address)
    }

    fn get_mut(&mut self, address: IpAddr) -> Option<&mut VirtualAddress> {
        self.addresses.iter_mut().find(|va| va.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualAddress> {
        self.addresses.iter()
    }

    /// Open addresses in configured order
    pub fn open_addresses(&self) -> Vec<IpAddr> {
        self.addresses
            .iter()
            .filter(|va| va.is_open())
            .map(|va| va.address)
            .collect()
    }

    /// Mark `address` as held by `service`. Returns false if the address is
    /// unknown or already allocated.
    pub fn allocate(
        &mut self,
        address: IpAddr,
        service: impl Into<String>,
        content_hash: impl Into<String>,
        artifact: impl Into<String>,
    ) -> bool {
        match self.get_mut(address) {
            Some(va) if va.is_open() => {
                va.state = AddressState::Allocated {
                    service: service.into(),
                    content_hash: content_hash.into(),
                    artifact: artifact.into(),
                };
                true
            }
            _ => false,
        }
    }

    /// Record new content for an allocated address
    pub fn update_hash(&mut self, address: IpAddr, hash: impl Into<String>) {
        if let Some(VirtualAddress {
            state: AddressState::Allocated { content_hash, .. },
            ..
        }) = self.get_mut(address)
        {
            *content_hash = hash.into();
        }
    }

    /// Return `address` to the open set
    pub fn release(&mut self, address: IpAddr) {
        if let Some(va) = self.get_mut(address) {
            va.state = AddressState::Open;
        }
    }

    /// service key → address, the inverse view of the occupants
    pub fn service_index(&self) -> BTreeMap<String, IpAddr> {
        self.addresses
            .iter()
            .filter_map(|va| va.occupant().map(|s| (s.to_string(), va.address)))
            .collect()
    }
}

/// Allocation state reconstructed at the start of a pass
#[derive(Debug, Clone, Default)]
pub struct PoolState {
    pub pool: AddressPool,
    pub index: BTreeMap<String, IpAddr>,
    /// Every artifact id still in the store, ours or not
    pub present: BTreeSet<String>,
}

/// Rebuild the pool from the artifacts in `store`.
///
/// - files without a valid marker header are not ours and are left alone
/// - an artifact for an address outside the pool is ignored
/// - an artifact for an address or service already claimed earlier in the
///   listing is removed
///
/// Only a failure to list the store is an error.
pub fn read_state(
    addresses: &[IpAddr],
    store: &dyn ArtifactStore,
) -> Result<PoolState, ArtifactError> {
    let mut state = PoolState {
        pool: AddressPool::new(addresses.iter().copied()),
        index: BTreeMap::new(),
        present: BTreeSet::new(),
    };

    for id in store.list()? {
        state.present.insert(id.clone());
        let content = match store.read(&id) {
            Ok(content) => content,
            Err(e) => {
                warn!(artifact = %id, error = %e, "Skipping unreadable artifact");
                continue;
            }
        };
        let header = match ArtifactHeader::parse(&content) {
            Ok(header) => header,
            Err(e) => {
                debug!(artifact = %id, reason = %e, "Ignoring file without flipbit markers");
                continue;
            }
        };

        let Some(current) = state.pool.get(header.address) else {
            warn!(
                artifact = %id,
                service = %header.service,
                address = %header.address,
                "Artifact references an address outside the pool"
            );
            continue;
        };

        let conflict = if let Some(holder) = current.occupant() {
            Some(format!("address already allocated to {}", holder))
        } else {
            state
                .index
                .get(&header.service)
                .map(|other| format!("service already holds {}", other))
        };
        if let Some(reason) = conflict {
            warn!(
                artifact = %id,
                service = %header.service,
                address = %header.address,
                reason = %reason,
                "Discarding conflicting artifact"
            );
            match store.remove(&id) {
                Ok(()) => {
                    state.present.remove(&id);
                }
                Err(e) => {
                    warn!(artifact = %id, error = %e, "Failed to remove conflicting artifact");
                }
            }
            continue;
        }

        state
            .pool
            .allocate(header.address, &header.service, content_hash(&content), &id);
        state.index.insert(header.service, header.address);
    }

    Ok(state)
}
