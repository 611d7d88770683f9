use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::is_local_id;

/// A registered library patron.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Student {
    pub id: String,
    /// Human-facing code printed on the card, unique per institution
    #[serde(rename = "studentId")]
    pub student_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfid: Option<String>,
    /// Tenant tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Student {
    pub fn new(id: impl Into<String>, student_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            student_id: student_id.into(),
            name: name.into(),
            email: None,
            course: None,
            department: None,
            year: None,
            level: None,
            rfid: None,
            library: None,
            created_at: None,
        }
    }

    pub fn is_local_only(&self) -> bool {
        is_local_id(&self.id)
    }

    /// Natural key used to find the remote counterpart of an offline registration.
    pub fn natural_key(&self) -> &str {
        &self.student_id
    }
}
