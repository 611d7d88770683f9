use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    BackendKind, DirKeyValueStore, FileBackend, KeyValueBackend, MemoryKeyValueStore,
    StorageBackend, StorageError,
};
use crate::config::Config;
use crate::models::{new_local_id, AttendanceEntry, OfflineData, OfflineDataPatch, Student};

/// Sub-directory of the data directory used by the key/value backend.
const KEY_VALUE_DIR: &str = "kv";

/// `last_written` before anything was persisted by this process.
const NOT_WRITTEN: usize = usize::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnsyncedCounts {
    pub students: usize,
    pub records: usize,
}

/// Durable home of the `OfflineData` envelope.
///
/// Backends are tried in order: writes go to the first backend that accepts
/// them, and reads prefer the backend that took the last write before
/// falling back to the first one holding data. A write that lands on a
/// fallback clears the backends ahead of it so their older envelope cannot
/// shadow it later. All read-modify-write cycles inside the process are
/// serialized by `write_lock`.
pub struct LocalCacheStore {
    backends: Vec<Box<dyn StorageBackend>>,
    last_written: AtomicUsize,
    write_lock: Mutex<()>,
}

impl LocalCacheStore {
    pub fn new(backends: Vec<Box<dyn StorageBackend>>) -> Self {
        Self {
            backends,
            last_written: AtomicUsize::new(NOT_WRITTEN),
            write_lock: Mutex::new(()),
        }
    }

    /// Store that only lives as long as the process.
    pub fn in_memory() -> Self {
        Self::new(vec![Box::new(KeyValueBackend::new(MemoryKeyValueStore::new()))])
    }

    /// Probe the backends under `data_dir` once, preferred kind first.
    /// An in-memory store is always appended as the last resort.
    pub fn select(preferred: BackendKind, data_dir: &Path) -> Self {
        let file: Box<dyn StorageBackend> = Box::new(FileBackend::in_dir(data_dir));
        let key_value: Box<dyn StorageBackend> = Box::new(KeyValueBackend::new(
            DirKeyValueStore::new(data_dir.join(KEY_VALUE_DIR)),
        ));
        let ordered = match preferred {
            BackendKind::File => [file, key_value],
            BackendKind::KeyValue => [key_value, file],
        };

        let mut backends: Vec<Box<dyn StorageBackend>> = ordered
            .into_iter()
            .filter(|backend| {
                let available = backend.is_available();
                if !available {
                    warn!(backend = backend.name(), "Storage backend unavailable, skipping");
                }
                available
            })
            .collect();
        backends.push(Box::new(KeyValueBackend::new(MemoryKeyValueStore::new())));

        let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
        info!(?names, dir = %data_dir.display(), "Local cache store ready");
        Self::new(backends)
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let dir = config.data_dir()?;
        Ok(Self::select(config.storage_backend, &dir))
    }

    /// Name of the backend writes go to first.
    pub fn active_backend(&self) -> &'static str {
        self.backends.first().map(|b| b.name()).unwrap_or("none")
    }

    /// Last persisted envelope, or an empty one. Never fails.
    pub async fn read(&self) -> OfflineData {
        self.load_current()
    }

    /// Shallow-merge `patch` into the stored envelope and persist it.
    /// Fails only when every backend refused the write.
    pub async fn write(&self, patch: OfflineDataPatch) -> Result<OfflineData, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load_current();
        data.merge(patch);
        data.enforce_unique_ids();
        self.persist(&data)?;
        Ok(data)
    }

    /// Read-modify-write under the store lock. Nothing is persisted if `f`
    /// reports no change by returning `false` from `changed`.
    pub async fn modify<R>(
        &self,
        f: impl FnOnce(&mut OfflineData) -> R,
        changed: impl FnOnce(&R) -> bool,
    ) -> Result<(R, OfflineData), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load_current();
        let result = f(&mut data);
        if changed(&result) {
            let removed = data.enforce_unique_ids();
            if removed > 0 {
                debug!(removed, "Dropped duplicate ids while persisting");
            }
            self.persist(&data)?;
        }
        Ok((result, data))
    }

    /// Remove persisted data from every backend.
    ///
    /// Fails if a backend that could not be cleared still holds an envelope
    /// `read()` would serve, or if no backend could be cleared at all.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.last_written.store(NOT_WRITTEN, Ordering::Release);
        let mut cleared_any = false;
        let mut last_error = None;
        let mut left_behind = None;
        for backend in &self.backends {
            match backend.clear_data() {
                Ok(()) => cleared_any = true,
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Failed to clear storage backend");
                    if matches!(backend.load_data(), Ok(Some(_))) {
                        left_behind = Some(e);
                    } else {
                        last_error = Some(e);
                    }
                }
            }
        }
        match (left_behind, last_error) {
            (Some(e), _) => Err(e),
            (None, Some(e)) if !cleared_any => Err(e),
            _ => Ok(()),
        }
    }

    /// Record a registration made at the desk. A student without an id gets
    /// a local-only one. Returns `false` if the id is already cached.
    pub async fn add_student(&self, mut student: Student) -> Result<bool, StorageError> {
        if student.id.is_empty() {
            student.id = new_local_id();
        }
        let (inserted, _) = self
            .modify(
                |data| {
                    if data.students.iter().any(|s| s.id == student.id) {
                        return false;
                    }
                    data.students.insert(0, student);
                    true
                },
                |inserted| *inserted,
            )
            .await?;
        Ok(inserted)
    }

    /// Record a scan made at the desk. An entry without an id gets a
    /// local-only one. Returns `false` if the id is already cached.
    pub async fn add_attendance(&self, mut entry: AttendanceEntry) -> Result<bool, StorageError> {
        if entry.id.is_empty() {
            entry.id = new_local_id();
        }
        let (inserted, _) = self
            .modify(
                |data| {
                    if data.attendance_records.iter().any(|r| r.id == entry.id) {
                        return false;
                    }
                    data.attendance_records.insert(0, entry);
                    true
                },
                |inserted| *inserted,
            )
            .await?;
        Ok(inserted)
    }

    pub async fn unsynced_counts(&self) -> UnsyncedCounts {
        let data = self.load_current();
        UnsyncedCounts {
            students: data.unsynced_students(),
            records: data.unsynced_records(),
        }
    }

    fn load_current(&self) -> OfflineData {
        let preferred = self.last_written.load(Ordering::Acquire);
        if let Some(data) = self.backends.get(preferred).and_then(|b| Self::load_from(b.as_ref())) {
            return data;
        }
        self.backends
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != preferred)
            .find_map(|(_, backend)| Self::load_from(backend.as_ref()))
            .unwrap_or_default()
    }

    fn load_from(backend: &dyn StorageBackend) -> Option<OfflineData> {
        match backend.load_data() {
            Ok(Some(json)) => match serde_json::from_str::<OfflineData>(&json) {
                Ok(mut data) => {
                    data.enforce_unique_ids();
                    Some(data)
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Cached data unreadable, trying next backend");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(backend = backend.name(), error = %e, "Failed to load cached data, trying next backend");
                None
            }
        }
    }

    fn persist(&self, data: &OfflineData) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(data)?;
        let mut last_error = StorageError::Unavailable("no storage backend configured".to_string());
        for (index, backend) in self.backends.iter().enumerate() {
            match backend.save_data(&json) {
                Ok(()) => {
                    self.last_written.store(index, Ordering::Release);
                    self.drop_stale_before(index);
                    return Ok(());
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Failed to save cached data, falling back");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Clear backends ahead of the one that just took a write, so a restart
    /// does not read their older envelope first.
    fn drop_stale_before(&self, index: usize) {
        for backend in &self.backends[..index] {
            if let Err(e) = backend.clear_data() {
                warn!(backend = backend.name(), error = %e, "Could not clear stale envelope on preferred backend");
            }
        }
    }
}
