//! Pure reconciliation rules used by the orchestrator.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{AttendanceEntry, AttendanceKey, OfflineData, Record, Student};

/// Replace local-only ids with the server ids they were confirmed under.
///
/// A record whose server id is already cached (realtime delivered the row
/// first) is dropped instead of renamed. Returns how many were dropped.
pub(crate) fn adopt_server_ids<T: Record>(
    records: &mut Vec<T>,
    confirmed: &HashMap<String, String>,
    set_id: impl Fn(&mut T, String),
) -> usize {
    if confirmed.is_empty() {
        return 0;
    }
    let mut present: HashSet<String> = records
        .iter()
        .filter(|r| !confirmed.contains_key(r.id()))
        .map(|r| r.id().to_string())
        .collect();

    let before = records.len();
    records.retain_mut(|record| match confirmed.get(record.id()) {
        Some(server_id) => {
            // insert() is false when the server id is already taken
            if !present.insert(server_id.clone()) {
                return false;
            }
            set_id(record, server_id.clone());
            true
        }
        None => true,
    });
    before - records.len()
}

/// Merge freshly pulled remote collections into the cached envelope.
///
/// Remote rows replace everything that has been synced. Local-only records
/// survive unless the remote already holds their natural key.
pub(crate) fn merge_pulled(
    data: &mut OfflineData,
    remote_students: Vec<Student>,
    remote_records: Vec<AttendanceEntry>,
    now: DateTime<Utc>,
) {
    let student_codes: HashSet<&str> = remote_students.iter().map(|s| s.natural_key()).collect();
    let mut students: Vec<Student> = data
        .students
        .drain(..)
        .filter(|s| s.is_local_only() && !student_codes.contains(s.natural_key()))
        .collect();
    students.extend(remote_students);

    let record_keys: HashSet<AttendanceKey> = remote_records.iter().map(|r| r.natural_key()).collect();
    let mut records: Vec<AttendanceEntry> = data
        .attendance_records
        .drain(..)
        .filter(|r| r.is_local_only() && !record_keys.contains(&r.natural_key()))
        .collect();
    records.extend(remote_records);
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    data.students = students;
    data.attendance_records = records;
    data.last_sync = Some(now);
}
