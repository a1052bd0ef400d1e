//! Scenario persistence: the store the simulator reads scenarios from, and
//! handles that clean up store records and output directories.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::schema::{ScenarioId, ScenarioRecord};

/// Errors raised by a scenario store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Scenario store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed scenario record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Scenario store lock poisoned")]
    Poisoned,
}

/// Keyed scenario storage shared by all evaluation workers.
pub trait ScenarioStore: Send + Sync {
    /// Insert or replace a record.
    fn put(&self, record: &ScenarioRecord) -> Result<(), StoreError>;

    fn get(&self, id: ScenarioId) -> Result<Option<ScenarioRecord>, StoreError>;

    /// Remove a record. Missing records are not an error.
    fn delete(&self, id: ScenarioId) -> Result<(), StoreError>;
}

// ============================================================================
// File-backed store
// ============================================================================

/// One JSON document per scenario, `scenario_<id>.json` in a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open a store in `dir`, creating the directory if needed.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document holding scenario `id`.
    pub fn path_of(&self, id: ScenarioId) -> PathBuf {
        self.dir.join(format!("scenario_{id}.json"))
    }
}

impl ScenarioStore for JsonFileStore {
    fn put(&self, record: &ScenarioRecord) -> Result<(), StoreError> {
        let path = self.path_of(record.id);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json).map_err(|source| StoreError::Io { path, source })
    }

    fn get(&self, id: ScenarioId) -> Result<Option<ScenarioRecord>, StoreError> {
        let path = self.path_of(id);
        match fs::read_to_string(&path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn delete(&self, id: ScenarioId) -> Result<(), StoreError> {
        let path = self.path_of(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store kept in process memory. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ScenarioId, ScenarioRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids currently stored, ascending.
    pub fn ids(&self) -> Vec<ScenarioId> {
        let mut ids: Vec<ScenarioId> = self
            .records
            .lock()
            .map(|r| r.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl ScenarioStore for MemoryStore {
    fn put(&self, record: &ScenarioRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: ScenarioId) -> Result<Option<ScenarioRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(&id).cloned())
    }

    fn delete(&self, id: ScenarioId) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.remove(&id);
        Ok(())
    }
}

// ============================================================================
// Handles & ids
// ============================================================================

/// Ownership of one evaluated scenario's store record and output directory.
///
/// Dropping the handle deletes both unless [`ScenarioHandle::retain`] was
/// called. Cleanup failures are logged, never raised.
pub struct ScenarioHandle {
    id: ScenarioId,
    store: Arc<dyn ScenarioStore>,
    output_dir: Option<PathBuf>,
    retained: bool,
}

impl ScenarioHandle {
    pub fn new(id: ScenarioId, store: Arc<dyn ScenarioStore>, output_dir: Option<PathBuf>) -> Self {
        Self {
            id,
            store,
            output_dir,
            retained: false,
        }
    }

    pub fn id(&self) -> ScenarioId {
        self.id
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Give up ownership without deleting anything.
    pub fn retain(mut self) -> ScenarioId {
        self.retained = true;
        self.id
    }
}

impl std::fmt::Debug for ScenarioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioHandle")
            .field("id", &self.id)
            .field("output_dir", &self.output_dir)
            .field("retained", &self.retained)
            .finish()
    }
}

impl Drop for ScenarioHandle {
    fn drop(&mut self) {
        if self.retained {
            return;
        }
        if let Err(e) = self.store.delete(self.id) {
            log::warn!("Failed to delete scenario {} from store: {e}", self.id);
        }
        if let Some(dir) = &self.output_dir
            && dir.exists()
            && let Err(e) = fs::remove_dir_all(dir)
        {
            log::warn!("Failed to remove {}: {e}", dir.display());
        }
    }
}

/// Allocates scenario ids unique within a run and unlikely to clash across runs.
#[derive(Debug)]
pub struct ScenarioIdGenerator {
    next: AtomicU64,
}

impl ScenarioIdGenerator {
    /// Start from a random base taken from a fresh v4 UUID.
    pub fn new() -> Self {
        Self::with_base(random_base())
    }

    pub fn with_base(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    pub fn next_id(&self) -> ScenarioId {
        ScenarioId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ScenarioIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// First nine decimal digits of the UUID node field.
fn random_base() -> u64 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let node = bytes[10..16]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    let digits = node.to_string();
    digits[..digits.len().min(9)].parse().unwrap_or(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    fn record(id: u64) -> ScenarioRecord {
        ScenarioRecord {
            id: ScenarioId(id),
            gene_values: vec![0, 2, 2],
            assignments: BTreeMap::from([(2, vec![20, 30])]),
        }
    }

    #[test]
    fn test_json_store_roundtrip_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::create(tmp.path().join("scenarios")).unwrap();

        store.put(&record(5)).unwrap();
        assert!(store.path_of(ScenarioId(5)).exists());
        assert_eq!(store.get(ScenarioId(5)).unwrap(), Some(record(5)));
        assert_eq!(store.get(ScenarioId(6)).unwrap(), None);

        store.delete(ScenarioId(5)).unwrap();
        store.delete(ScenarioId(5)).unwrap();
        assert_eq!(store.get(ScenarioId(5)).unwrap(), None);
    }

    #[test]
    fn test_handle_drop_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put(&record(1)).unwrap();
        let out = tmp.path().join("OUTPUT-1-");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("SED_OL.txt"), "1").unwrap();

        let handle = ScenarioHandle::new(ScenarioId(1), store.clone(), Some(out.clone()));
        assert_eq!(handle.id(), ScenarioId(1));
        drop(handle);

        assert!(store.is_empty());
        assert!(!out.exists());
    }

    #[test]
    fn test_retained_handle_keeps_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put(&record(2)).unwrap();
        let out = tmp.path().join("OUTPUT-2-");
        fs::create_dir_all(&out).unwrap();

        let handle = ScenarioHandle::new(ScenarioId(2), store.clone(), Some(out.clone()));
        assert_eq!(handle.retain(), ScenarioId(2));

        assert_eq!(store.ids(), vec![ScenarioId(2)]);
        assert!(out.exists());
    }

    #[test]
    fn test_id_generator_unique() {
        let ids = ScenarioIdGenerator::with_base(100);
        let drawn: HashSet<ScenarioId> = (0..50).map(|_| ids.next_id()).collect();
        assert_eq!(drawn.len(), 50);
        assert!(drawn.contains(&ScenarioId(100)));
        assert!(drawn.contains(&ScenarioId(149)));
    }

    #[test]
    fn test_random_base_has_at_most_nine_digits() {
        for _ in 0..20 {
            assert!(random_base() < 1_000_000_000);
        }
    }
}
