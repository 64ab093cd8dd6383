//! Execution log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity / category of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    System,
}

/// Extra payload attached to a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    /// Reference to an image in the artifacts container
    Image { file_name: String },
}

/// An immutable record in the execution log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
    /// Role the entry is attributed to (e.g. the work unit's role)
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}
