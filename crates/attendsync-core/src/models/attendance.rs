use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::is_local_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum AttendanceType {
    #[serde(rename = "check-in")]
    CheckIn,
    #[serde(rename = "check-out")]
    CheckOut,
}

impl AttendanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceType::CheckIn => "check-in",
            AttendanceType::CheckOut => "check-out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "check-in" => Some(AttendanceType::CheckIn),
            "check-out" => Some(AttendanceType::CheckOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttendanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the patron was identified at the desk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum AttendanceMethod {
    Barcode,
    Biometric,
    Manual,
    Rfid,
}

impl AttendanceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceMethod::Barcode => "barcode",
            AttendanceMethod::Biometric => "biometric",
            AttendanceMethod::Manual => "manual",
            AttendanceMethod::Rfid => "rfid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "barcode" => Some(AttendanceMethod::Barcode),
            "biometric" => Some(AttendanceMethod::Biometric),
            "manual" => Some(AttendanceMethod::Manual),
            "rfid" => Some(AttendanceMethod::Rfid),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttendanceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single check-in or check-out event.
///
/// `student_name` is a snapshot taken when the event happened, so renaming a
/// student later does not rewrite history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct AttendanceEntry {
    pub id: String,
    #[serde(rename = "studentId")]
    pub student_id: String,
    #[serde(rename = "studentName")]
    pub student_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AttendanceType,
    pub method: AttendanceMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
}

/// Business identity of an attendance event, independent of its id.
///
/// Timestamps are compared at millisecond resolution because the remote store
/// keeps microseconds while local clocks produce nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttendanceKey {
    pub student_id: String,
    pub timestamp_millis: i64,
    pub kind: AttendanceType,
}

impl AttendanceEntry {
    pub fn new(
        id: impl Into<String>,
        student_id: impl Into<String>,
        student_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: AttendanceType,
        method: AttendanceMethod,
    ) -> Self {
        Self {
            id: id.into(),
            student_id: student_id.into(),
            student_name: student_name.into(),
            timestamp,
            kind,
            method,
            barcode: None,
            purpose: None,
            contact: None,
            library: None,
        }
    }

    pub fn is_local_only(&self) -> bool {
        is_local_id(&self.id)
    }

    pub fn natural_key(&self) -> AttendanceKey {
        AttendanceKey {
            student_id: self.student_id.clone(),
            timestamp_millis: self.timestamp.timestamp_millis(),
            kind: self.kind,
        }
    }

    /// Whether the event falls in `[start, end)`.
    pub fn within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.timestamp >= start && self.timestamp < end
    }
}
