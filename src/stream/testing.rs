//! In-memory artifact store with failure injection, for tests

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::artifact::{ArtifactError, ArtifactStore};

#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, String>>,
    fail_writes: Mutex<HashSet<String>>,
    fail_removes: Mutex<HashSet<String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn files(&self) -> BTreeMap<String, String> {
        self.files.lock().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.files.lock().unwrap().get(id).cloned()
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes_to(&self, id: &str) {
        self.fail_writes.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_removes_of(&self, id: &str) {
        self.fail_removes.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self) {
        self.fail_writes.lock().unwrap().clear();
        self.fail_removes.lock().unwrap().clear();
    }

    fn injected(id: &str) -> ArtifactError {
        ArtifactError::Io {
            id: id.to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"),
        }
    }
}

impl ArtifactStore for MemoryStore {
    fn list(&self) -> Result<Vec<String>, ArtifactError> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }

    fn read(&self, id: &str) -> Result<String, ArtifactError> {
        self.get(id).ok_or_else(|| ArtifactError::Io {
            id: id.to_string(),
            source: io::ErrorKind::NotFound.into(),
        })
    }

    fn write(&self, id: &str, content: &str) -> Result<(), ArtifactError> {
        if self.fail_writes.lock().unwrap().contains(id) {
            return Err(Self::injected(id));
        }
        self.files
            .lock()
            .unwrap()
            .insert(id.to_string(), content.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), ArtifactError> {
        if self.fail_removes.lock().unwrap().contains(id) {
            return Err(Self::injected(id));
        }
        self.files.lock().unwrap().remove(id);
        Ok(())
    }
}
