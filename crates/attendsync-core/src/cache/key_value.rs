use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use super::{StorageBackend, StorageError};

/// Fixed key the envelope is stored under.
pub const STORAGE_KEY: &str = "attendsync_offline_data";

/// Synchronous string key/value storage, in the manner of browser local storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Backend name reported in logs and status output.
    fn label(&self) -> &'static str {
        "key_value"
    }
}

/// Key/value store keeping one `<key>.json` file per key.
pub struct DirKeyValueStore {
    dir: PathBuf,
}

impl DirKeyValueStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for DirKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.key_path(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local key/value store. Used as the last resort when nothing on
/// disk is writable, and in tests.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn label(&self) -> &'static str {
        "memory"
    }
}

/// Storage backend persisting the envelope under [`STORAGE_KEY`].
pub struct KeyValueBackend<S: KeyValueStore> {
    store: S,
    key: String,
}

impl<S: KeyValueStore> KeyValueBackend<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            key: STORAGE_KEY.to_string(),
        }
    }

    pub fn with_key(store: S, key: impl Into<String>) -> Self {
        Self { store, key: key.into() }
    }
}

impl<S: KeyValueStore> StorageBackend for KeyValueBackend<S> {
    fn name(&self) -> &'static str {
        self.store.label()
    }

    fn is_available(&self) -> bool {
        // Round-trip a scratch key, the way feature detection checks local storage
        let scratch = format!("{}__check", self.key);
        let ok = self.store.set(&scratch, "1").is_ok()
            && matches!(self.store.get(&scratch), Ok(Some(ref v)) if v == "1");
        let _ = self.store.remove(&scratch);
        ok
    }

    fn save_data(&self, json: &str) -> Result<(), StorageError> {
        self.store.set(&self.key, json)
    }

    fn load_data(&self) -> Result<Option<String>, StorageError> {
        Ok(self.store.get(&self.key)?.filter(|s| !s.trim().is_empty()))
    }

    fn clear_data(&self) -> Result<(), StorageError> {
        self.store.remove(&self.key)
    }
}
