//! Idempotent application of remote changes to a cached collection.
//!
//! All three operations are keyed by record id and check for presence
//! first, so replays and races with a concurrent pull converge.

use crate::models::Record;

#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Insert(T),
    Update(T),
    Delete(String),
}

/// Apply `change` to `records`. Returns whether anything changed.
///
/// - insert: prepend unless the id is already present
/// - update: replace in place; an unknown id is ignored rather than inserted
/// - delete: remove if present
pub fn apply_change<T: Record>(records: &mut Vec<T>, change: Change<T>) -> bool {
    match change {
        Change::Insert(record) => {
            if records.iter().any(|r| r.id() == record.id()) {
                return false;
            }
            records.insert(0, record);
            true
        }
        Change::Update(record) => match records.iter_mut().find(|r| r.id() == record.id()) {
            Some(existing) => {
                *existing = record;
                true
            }
            None => false,
        },
        Change::Delete(id) => {
            let before = records.len();
            records.retain(|r| r.id() != id);
            records.len() != before
        }
    }
}
