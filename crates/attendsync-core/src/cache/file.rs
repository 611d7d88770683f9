use std::path::{Path, PathBuf};

use tracing::debug;

use super::{StorageBackend, StorageError};

/// File name of the envelope inside the data directory.
pub const DATA_FILE: &str = "offline-data.json";

/// Desktop storage: the whole envelope in one JSON file.
///
/// Saves go through a temporary sibling file and a rename so a crash never
/// leaves a half-written envelope behind.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Backend storing `offline-data.json` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(DATA_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_available(&self) -> bool {
        let Some(parent) = self.path.parent() else {
            return false;
        };
        if let Err(e) = std::fs::create_dir_all(parent) {
            debug!(path = %parent.display(), error = %e, "Data directory not creatable");
            return false;
        }
        match std::fs::metadata(parent) {
            Ok(meta) => !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    fn save_data(&self, json: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load_data(&self) -> Result<Option<String>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(contents))
    }

    fn clear_data(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
