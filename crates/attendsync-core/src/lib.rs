//! attendsync-core - offline-first attendance cache with remote sync.
//!
//! Desk clients record check-ins against a local cache that keeps working
//! without a network. This crate provides:
//!
//! - `cache`: the durable local store with backend fallback
//! - `realtime`: remote change subscriptions applied to the cache
//! - `sync`: push/pull reconciliation with the remote store
//! - `integrity`: read-only drift report between local and remote counts
//!
//! Components are constructed explicitly and share the store through an
//! `Arc`; nothing here is a process-wide singleton.

pub mod api;
pub mod cache;
pub mod config;
pub mod integrity;
pub mod models;
pub mod realtime;
pub mod sync;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{RemoteError, RemoteStore, SupabaseClient};
pub use cache::{BackendKind, LocalCacheStore, StorageError};
pub use config::Config;
pub use integrity::{DataIntegrityChecker, IntegrityReport};
pub use models::{AttendanceEntry, AttendanceMethod, AttendanceType, OfflineData, Student};
pub use realtime::{ChangeFeed, PhoenixFeed, RealtimeError, RealtimeListener};
pub use sync::{PushSummary, SyncError, SyncOrchestrator, SyncReport, SyncStatus};
