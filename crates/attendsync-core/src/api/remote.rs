use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::RemoteError;
use crate::models::{AttendanceEntry, AttendanceKey, Student};

/// Half-open time range `[start, end)`.
pub type TimeWindow = (DateTime<Utc>, DateTime<Utc>);

/// Authoritative record store the offline cache reconciles against.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_students(&self) -> Result<Vec<Student>, RemoteError>;

    /// Attendance rows, newest first. `since` limits the result to rows at
    /// or after that instant.
    async fn fetch_attendance(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AttendanceEntry>, RemoteError>;

    /// Look up a student by the human-facing student code.
    async fn find_student(&self, student_id: &str) -> Result<Option<Student>, RemoteError>;

    /// Look up an attendance row by natural key.
    async fn find_attendance(
        &self,
        key: &AttendanceKey,
    ) -> Result<Option<AttendanceEntry>, RemoteError>;

    /// Insert and return the stored row carrying the server-issued id.
    async fn insert_student(&self, student: &Student) -> Result<Student, RemoteError>;

    /// Insert and return the stored row carrying the server-issued id.
    async fn insert_attendance(&self, entry: &AttendanceEntry)
        -> Result<AttendanceEntry, RemoteError>;

    async fn count_attendance(&self, window: Option<TimeWindow>) -> Result<u64, RemoteError>;
}
