//! Remote row shapes for the `students` and `attendance_records` tables.
//!
//! The remote store uses snake_case column names and may hand back ids as
//! either strings (uuid) or numbers (bigserial). Rows are converted into the
//! local camelCase models with `TryFrom`, which is where malformed payloads
//! are rejected.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::{AttendanceEntry, AttendanceMethod, AttendanceType, Student};

#[derive(Error, Debug)]
pub enum RowError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Malformed row: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudentRow {
    #[serde(default, deserialize_with = "deserialize_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub student_id: Option<String>,
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text", skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text", skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttendanceRow {
    #[serde(default, deserialize_with = "deserialize_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub student_id: Option<String>,
    pub student_name: Option<String>,
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
}

impl StudentRow {
    /// Row to insert remotely. The id is left out so the server assigns one.
    pub fn for_insert(student: &Student) -> Self {
        Self {
            id: None,
            student_id: Some(student.student_id.clone()),
            name: Some(student.name.clone()),
            email: student.email.clone(),
            course: student.course.clone(),
            department: student.department.clone(),
            year: student.year.clone(),
            level: student.level.clone(),
            rfid: student.rfid.clone(),
            library: student.library.clone(),
            created_at: student.created_at.map(|t| t.to_rfc3339()),
        }
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, RowError> {
        Ok(serde_json::from_value(value)?)
    }
}

impl AttendanceRow {
    /// Row to insert remotely. The id is left out so the server assigns one.
    pub fn for_insert(entry: &AttendanceEntry) -> Self {
        Self {
            id: None,
            student_id: Some(entry.student_id.clone()),
            student_name: Some(entry.student_name.clone()),
            timestamp: Some(entry.timestamp.to_rfc3339()),
            kind: Some(entry.kind.as_str().to_string()),
            method: Some(entry.method.as_str().to_string()),
            barcode: entry.barcode.clone(),
            purpose: entry.purpose.clone(),
            contact: entry.contact.clone(),
            library: entry.library.clone(),
        }
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, RowError> {
        Ok(serde_json::from_value(value)?)
    }
}

impl TryFrom<StudentRow> for Student {
    type Error = RowError;

    fn try_from(row: StudentRow) -> Result<Self, Self::Error> {
        let created_at = match row.created_at.as_deref() {
            Some(raw) => Some(parse_timestamp(raw)?),
            None => None,
        };
        Ok(Student {
            id: required(row.id, "id")?,
            student_id: required(row.student_id, "student_id")?,
            name: required(row.name, "name")?,
            email: row.email,
            course: row.course,
            department: row.department,
            year: row.year,
            level: row.level,
            rfid: row.rfid,
            library: row.library,
            created_at,
        })
    }
}

impl TryFrom<AttendanceRow> for AttendanceEntry {
    type Error = RowError;

    fn try_from(row: AttendanceRow) -> Result<Self, Self::Error> {
        let raw_kind = required(row.kind, "type")?;
        let kind = AttendanceType::parse(&raw_kind).ok_or(RowError::InvalidValue {
            field: "type",
            value: raw_kind,
        })?;
        let raw_method = required(row.method, "method")?;
        let method = AttendanceMethod::parse(&raw_method).ok_or(RowError::InvalidValue {
            field: "method",
            value: raw_method,
        })?;
        let timestamp = parse_timestamp(&required(row.timestamp, "timestamp")?)?;

        Ok(AttendanceEntry {
            id: required(row.id, "id")?,
            student_id: required(row.student_id, "student_id")?,
            student_name: row.student_name.unwrap_or_default(),
            timestamp,
            kind,
            method,
            barcode: row.barcode,
            purpose: row.purpose,
            contact: row.contact,
            library: row.library,
        })
    }
}

/// Map a raw remote row into a `Student`.
pub fn student_from_value(value: serde_json::Value) -> Result<Student, RowError> {
    Student::try_from(StudentRow::from_value(value)?)
}

/// Map a raw remote row into an `AttendanceEntry`.
pub fn attendance_from_value(value: serde_json::Value) -> Result<AttendanceEntry, RowError> {
    AttendanceEntry::try_from(AttendanceRow::from_value(value)?)
}

/// Parse an RFC 3339 timestamp; a timestamp without offset is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RowError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Postgres `timestamp without time zone` columns, with either separator
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    // Postgres also emits short offsets like "+00"
    if let Ok(dt) = DateTime::parse_from_str(&format!("{}:00", raw), "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    Err(RowError::InvalidTimestamp(raw.to_string()))
}

fn required(value: Option<String>, field: &'static str) -> Result<String, RowError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RowError::MissingField(field)),
    }
}

/// Accept string or numeric ids.
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_text(deserializer)
}

/// Accept a string, number, or null column as optional text.
fn deserialize_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}
