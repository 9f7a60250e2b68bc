//! Journal record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    System,
    Process,
    Browser,
    Shell,
}

/// Immutable once enqueued. `device_name` may be absent on lines written
/// by older agents; the read path backfills it from config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub username: String,
    #[serde(default)]
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub log_type: LogType,
    pub program: String,
    pub action: String,
}

impl LogEntry {
    pub fn new(
        username: &str,
        device_name: &str,
        log_type: LogType,
        program: &str,
        action: &str,
    ) -> Self {
        // Records produced while the console is unattended belong to
        // "system".
        let username = if username.is_empty() {
            "system"
        } else {
            username
        };

        Self {
            username: username.to_string(),
            device_name: device_name.to_string(),
            timestamp: Utc::now(),
            log_type,
            program: program.to_string(),
            action: action.to_string(),
        }
    }
}
