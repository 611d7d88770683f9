use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Change, RealtimeError};
use crate::models::RowError;

/// A record collection mirrored by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Students,
    Attendance,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Students, Collection::Attendance];

    /// Remote table name.
    pub fn table(&self) -> &'static str {
        match self {
            Collection::Students => "students",
            Collection::Attendance => "attendance_records",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Normalised change notification: `{eventType, new, old}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn parse(raw: Value) -> Result<Self, RealtimeError> {
        serde_json::from_value(raw).map_err(|e| RealtimeError::Malformed(e.to_string()))
    }

    /// Decode into a typed change, mapping row payloads with `convert`.
    pub fn into_change<T>(
        self,
        convert: impl Fn(Value) -> Result<T, RowError>,
    ) -> Result<Change<T>, RealtimeError> {
        let malformed = |e: RowError| RealtimeError::Malformed(e.to_string());
        match self.event_type {
            ChangeKind::Insert => {
                let row = non_empty(self.new).ok_or_else(|| missing("new"))?;
                Ok(Change::Insert(convert(row).map_err(malformed)?))
            }
            ChangeKind::Update => {
                let row = non_empty(self.new).ok_or_else(|| missing("new"))?;
                Ok(Change::Update(convert(row).map_err(malformed)?))
            }
            ChangeKind::Delete => {
                let id = non_empty(self.old)
                    .and_then(|old| row_id(&old))
                    .or_else(|| non_empty(self.new).and_then(|new| row_id(&new)))
                    .ok_or_else(|| missing("old.id"))?;
                Ok(Change::Delete(id))
            }
        }
    }
}

fn missing(what: &str) -> RealtimeError {
    RealtimeError::Malformed(format!("change payload without {}", what))
}

/// Drops `null` and `{}`, which the realtime service sends for absent rows.
fn non_empty(value: Option<Value>) -> Option<Value> {
    match value {
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(Value::Null) | None => None,
        other => other,
    }
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
