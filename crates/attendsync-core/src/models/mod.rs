//! Data models for the attendance cache.
//!
//! This module contains the data structures shared by the cache, the
//! realtime listener and the sync orchestrator:
//!
//! - `Student`: identity record created on registration
//! - `AttendanceEntry`: an immutable check-in / check-out event
//! - `OfflineData`: the persisted cache envelope
//! - Remote row types (`StudentRow`, `AttendanceRow`) in the remote store's
//!   snake_case shape, with conversion into the local camelCase shape
//!
//! Records created while offline carry a `local_` id until the remote store
//! confirms them; see [`is_local_id`].

pub mod attendance;
pub mod envelope;
pub mod row;
pub mod student;

pub use attendance::{AttendanceEntry, AttendanceKey, AttendanceMethod, AttendanceType};
pub use envelope::{dedupe_by_id, OfflineData, OfflineDataPatch, Record};
pub use row::{attendance_from_value, student_from_value, AttendanceRow, RowError, StudentRow};
pub use student::Student;

/// Reserved id prefix for records that have not been confirmed by the remote store.
pub const LOCAL_ID_PREFIX: &str = "local_";

/// Whether `id` marks a record created offline and not yet synced.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Generate a fresh local-only id.
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4().simple())
}
