use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode cache data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Which persistence backend to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single JSON file in the data directory (desktop host)
    #[default]
    File,
    /// Fixed key in a key/value store (browser-style storage)
    KeyValue,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::File => write!(f, "file"),
            BackendKind::KeyValue => write!(f, "key_value"),
        }
    }
}

/// A place the serialized envelope can be persisted.
///
/// Implementations are synchronous; the store calls them from async code
/// the same way it would touch the local filesystem.
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe whether the backend can be used on this host.
    fn is_available(&self) -> bool;

    fn save_data(&self, json: &str) -> Result<(), StorageError>;

    /// `Ok(None)` when nothing has been persisted yet.
    fn load_data(&self) -> Result<Option<String>, StorageError>;

    /// Removing data that does not exist is not an error.
    fn clear_data(&self) -> Result<(), StorageError>;
}
