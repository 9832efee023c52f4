use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::cluster::AssignmentMap;
use crate::stream::{
    read_state, AddressPool, ArtifactError, ArtifactStore, DirectoryStore, ReconcileError,
    ReconcileResult, Reconciler,
};

/// Errors running a pass from the HTTP layer
#[derive(Error, Debug)]
pub enum PassError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    State(#[from] ArtifactError),

    #[error("Reconciliation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What the last completed pass did
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub results: Vec<ReconcileResult>,
    pub freed: Vec<String>,
}

/// Shared state of the reconciler endpoint
pub struct ReconcilerState<S = DirectoryStore> {
    pub reconciler: Arc<Reconciler<S>>,
    /// Held for the whole of a pass; passes never interleave
    pass_lock: Arc<Mutex<()>>,
    pub pool: Arc<RwLock<AddressPool>>,
    pub last_pass: Arc<RwLock<Option<PassSummary>>>,
}

// Manual impl: `S` itself does not need to be Clone.
impl<S> Clone for ReconcilerState<S> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            pass_lock: Arc::clone(&self.pass_lock),
            pool: Arc::clone(&self.pool),
            last_pass: Arc::clone(&self.last_pass),
        }
    }
}

impl<S: ArtifactStore + 'static> ReconcilerState<S> {
    pub fn new(reconciler: Reconciler<S>) -> Self {
        let pool = AddressPool::new(reconciler.addresses().iter().copied());
        Self {
            reconciler: Arc::new(reconciler),
            pass_lock: Arc::new(Mutex::new(())),
            pool: Arc::new(RwLock::new(pool)),
            last_pass: Arc::new(RwLock::new(None)),
        }
    }

    /// Load the allocation state left on disk by a previous run
    pub async fn load(&self) -> Result<(), PassError> {
        let guard = Arc::clone(&self.pass_lock).lock_owned().await;
        let reconciler = Arc::clone(&self.reconciler);
        let pool = Arc::clone(&self.pool);

        tokio::task::spawn_blocking(move || -> Result<(), PassError> {
            let _guard = guard;
            let state = read_state(reconciler.addresses(), reconciler.store())?;
            debug!(allocated = state.index.len(), "Loaded existing allocations");
            *pool.blocking_write() = state.pool;
            Ok(())
        })
        .await?
    }

    /// Run one reconciliation pass for `desired`.
    ///
    /// The pass lock and the view updates live in the blocking task, so a
    /// dropped request cannot let a second pass start while this one is
    /// still touching the artifact directory.
    pub async fn run_pass(&self, desired: AssignmentMap) -> Result<PassSummary, PassError> {
        let guard = Arc::clone(&self.pass_lock).lock_owned().await;
        let reconciler = Arc::clone(&self.reconciler);
        let pool = Arc::clone(&self.pool);
        let last_pass = Arc::clone(&self.last_pass);

        // Artifact I/O is blocking.
        tokio::task::spawn_blocking(move || -> Result<PassSummary, PassError> {
            let _guard = guard;
            let outcome = reconciler.reconcile(&desired)?;
            let summary = PassSummary {
                id: Uuid::new_v4(),
                completed_at: Utc::now(),
                results: outcome.results,
                freed: outcome.freed,
            };
            *pool.blocking_write() = outcome.pool;
            *last_pass.blocking_write() = Some(summary.clone());
            Ok(summary)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Assignment, ServiceDescriptor, ServicePort};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::stream::testing::MemoryStore;
    use crate::stream::Disposition;
    use tempfile::TempDir;

    /// Store whose listing is slow and records how many passes overlap
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ArtifactStore for SlowStore {
        fn list(&self) -> Result<Vec<String>, ArtifactError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.inner.list()
        }

        fn read(&self, id: &str) -> Result<String, ArtifactError> {
            self.inner.read(id)
        }

        fn write(&self, id: &str, content: &str) -> Result<(), ArtifactError> {
            self.inner.write(id, content)
        }

        fn remove(&self, id: &str) -> Result<(), ArtifactError> {
            self.inner.remove(id)
        }
    }

    fn desired() -> AssignmentMap {
        let service = ServiceDescriptor::new("web", "default").with_port(ServicePort::tcp(80, 31000));
        let assignment = Assignment::new(service, vec!["h1".to_string()]);
        [(assignment.key(), assignment)].into_iter().collect()
    }

    fn state_in(dir: &TempDir) -> ReconcilerState {
        let reconciler = Reconciler::new(
            DirectoryStore::new(dir.path()),
            vec!["10.0.0.1".parse().unwrap()],
        );
        ReconcilerState::new(reconciler)
    }

    #[tokio::test]
    async fn test_run_pass_updates_views() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir);
        assert!(state.last_pass.read().await.is_none());

        let summary = state.run_pass(desired()).await.unwrap();

        assert_eq!(summary.results[0].status, Disposition::Created);
        assert!(state.pool.read().await.open_addresses().is_empty());
        assert_eq!(state.last_pass.read().await.as_ref().unwrap().id, summary.id);
    }

    #[tokio::test]
    async fn test_load_picks_up_previous_run() {
        let dir = TempDir::new().unwrap();
        state_in(&dir).run_pass(desired()).await.unwrap();

        let restarted = state_in(&dir);
        assert_eq!(restarted.pool.read().await.open_addresses().len(), 1);
        restarted.load().await.unwrap();

        let pool = restarted.pool.read().await;
        assert_eq!(
            pool.service_index().get("web.default"),
            Some(&"10.0.0.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_run_pass_fails_without_directory() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir);
        drop(dir);

        let err = state.run_pass(desired()).await.unwrap_err();
        assert!(matches!(err, PassError::Reconcile(_)));
    }

    #[tokio::test]
    async fn test_cancelled_pass_still_blocks_the_next_one() {
        let reconciler = Reconciler::new(
            SlowStore::default(),
            vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
        );
        let state = ReconcilerState::new(reconciler);

        // The caller gives up while the first pass is still listing.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), state.run_pass(desired())).await;
        assert!(abandoned.is_err());

        let api = ServiceDescriptor::new("api", "default").with_port(ServicePort::tcp(8080, 32000));
        let api = Assignment::new(api, vec!["h1".to_string()]);
        let mut both = desired();
        both.insert(api.key(), api);
        let summary = state.run_pass(both).await.unwrap();

        let store = state.reconciler.store();
        assert_eq!(store.max_active.load(Ordering::SeqCst), 1);
        // The second pass saw what the abandoned one wrote.
        let web = summary.results.iter().find(|r| r.service == "web.default").unwrap();
        assert_eq!(web.status, Disposition::NoChange);
        assert_eq!(store.inner.files().len(), 2);
    }
}
