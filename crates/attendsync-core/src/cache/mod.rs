//! Local caching module for offline data access.
//!
//! This module provides the `LocalCacheStore`, which persists the
//! `OfflineData` envelope (students, attendance records, last sync time)
//! as JSON through one of two storage backends:
//!
//! - `FileBackend`: a single JSON file, preferred on desktop hosts
//! - `KeyValueBackend`: a fixed key in a key/value store, the
//!   browser-style fallback
//!
//! The backends are chosen once at startup; the store falls back to the
//! next backend whenever one fails, and `read()` degrades to an empty
//! envelope rather than erroring.

pub mod backend;
pub mod file;
pub mod key_value;
pub mod store;

pub use backend::{BackendKind, StorageBackend, StorageError};
pub use file::FileBackend;
pub use key_value::{DirKeyValueStore, KeyValueBackend, KeyValueStore, MemoryKeyValueStore, STORAGE_KEY};
pub use store::{LocalCacheStore, UnsyncedCounts};
