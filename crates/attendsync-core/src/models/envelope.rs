use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttendanceEntry, Student};

/// Anything stored in the cache that is identified by an `id`.
pub trait Record {
    fn id(&self) -> &str;
}

impl Record for Student {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for AttendanceEntry {
    fn id(&self) -> &str {
        &self.id
    }
}

/// The persisted cache envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct OfflineData {
    #[serde(default)]
    pub students: Vec<Student>,
    #[serde(rename = "attendanceRecords", default)]
    pub attendance_records: Vec<AttendanceEntry>,
    #[serde(rename = "lastSync", default)]
    pub last_sync: Option<DateTime<Utc>>,
}

impl OfflineData {
    pub fn is_empty(&self) -> bool {
        self.students.is_empty() && self.attendance_records.is_empty() && self.last_sync.is_none()
    }

    /// Shallow merge: every key present in `patch` replaces the stored one.
    pub fn merge(&mut self, patch: OfflineDataPatch) {
        if let Some(students) = patch.students {
            self.students = students;
        }
        if let Some(records) = patch.attendance_records {
            self.attendance_records = records;
        }
        if let Some(last_sync) = patch.last_sync {
            self.last_sync = last_sync;
        }
    }

    /// Drop repeated ids, keeping the first occurrence.
    /// Returns how many records were removed.
    pub fn enforce_unique_ids(&mut self) -> usize {
        let before = self.students.len() + self.attendance_records.len();
        dedupe_by_id(&mut self.students);
        dedupe_by_id(&mut self.attendance_records);
        before - (self.students.len() + self.attendance_records.len())
    }

    pub fn unsynced_students(&self) -> usize {
        self.students.iter().filter(|s| s.is_local_only()).count()
    }

    pub fn unsynced_records(&self) -> usize {
        self.attendance_records.iter().filter(|r| r.is_local_only()).count()
    }
}

/// Partial update applied by `LocalCacheStore::write`.
///
/// `last_sync` is doubly optional so a patch can reset it to `None`.
#[derive(Debug, Clone, Default)]
pub struct OfflineDataPatch {
    pub students: Option<Vec<Student>>,
    pub attendance_records: Option<Vec<AttendanceEntry>>,
    pub last_sync: Option<Option<DateTime<Utc>>>,
}

impl OfflineDataPatch {
    pub fn students(students: Vec<Student>) -> Self {
        Self {
            students: Some(students),
            ..Default::default()
        }
    }

    pub fn attendance_records(records: Vec<AttendanceEntry>) -> Self {
        Self {
            attendance_records: Some(records),
            ..Default::default()
        }
    }

    pub fn last_sync(at: Option<DateTime<Utc>>) -> Self {
        Self {
            last_sync: Some(at),
            ..Default::default()
        }
    }
}

/// Remove later records whose id was already seen.
pub fn dedupe_by_id<T: Record>(records: &mut Vec<T>) {
    let mut seen = HashSet::new();
    records.retain(|r| seen.insert(r.id().to_string()));
}
