//! Policy document and path matching rules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A versioned allow-list. Either absent or fully valid in memory;
/// readers never observe a partially-applied update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,
    pub items: Vec<String>,
    /// Optional expected content hashes, keyed by normalized path,
    /// hex-encoded SHA-256.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<HashMap<String, String>>,
    pub updated_at: DateTime<Utc>,
}

/// Paths that are always permitted regardless of the rule list.
const SYSTEM_PREFIXES: [&str; 4] = [
    "c:\\windows\\system32\\",
    "c:\\windows\\syswow64\\",
    "c:\\windows\\winsxs\\",
    "c:\\programdata\\microsoft\\windows defender\\",
];

/// Canonical form used for every comparison: case-folded, forward slashes
/// turned into backslashes, repeated separators collapsed.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.to_lowercase().replace('/', "\\");
    while normalized.contains("\\\\") {
        normalized = normalized.replace("\\\\", "\\");
    }
    normalized
}

/// A rule ending in `*` matches any normalized path starting with its
/// prefix; anything else must match exactly.
pub fn rule_matches(rule: &str, normalized_path: &str) -> bool {
    let rule = normalize_path(rule);
    if let Some(prefix) = rule.strip_suffix('*') {
        normalized_path.starts_with(prefix)
    } else {
        rule == normalized_path
    }
}

pub fn is_system_path(normalized_path: &str) -> bool {
    SYSTEM_PREFIXES
        .iter()
        .any(|prefix| normalized_path.starts_with(prefix))
}

/// Built-in policy used when neither the cache nor the server is
/// available. Covers the System32 tree, the common browsers, Office and
/// Defender so a fresh install cannot strand the machine.
pub fn default_policy() -> Policy {
    Policy {
        version: "1.0.0-default".to_string(),
        updated_at: Utc::now(),
        hashes: None,
        items: vec![
            "C:\\Windows\\System32\\*".to_string(),
            "C:\\Windows\\SysWOW64\\*".to_string(),
            "C:\\Windows\\WinSxS\\*".to_string(),
            "C:\\Windows\\System32\\notepad.exe".to_string(),
            "C:\\Windows\\System32\\calc.exe".to_string(),
            "C:\\Windows\\System32\\mspaint.exe".to_string(),
            "C:\\Windows\\System32\\cmd.exe".to_string(),
            "C:\\Windows\\System32\\powershell.exe".to_string(),
            "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe".to_string(),
            "C:\\Program Files (x86)\\Google\\Chrome\\Application\\chrome.exe".to_string(),
            "C:\\Program Files\\Mozilla Firefox\\firefox.exe".to_string(),
            "C:\\Program Files (x86)\\Mozilla Firefox\\firefox.exe".to_string(),
            "C:\\Program Files (x86)\\Microsoft\\Edge\\Application\\msedge.exe".to_string(),
            "C:\\Program Files\\Microsoft\\Edge\\Application\\msedge.exe".to_string(),
            "C:\\Program Files\\Internet Explorer\\iexplore.exe".to_string(),
            "C:\\Program Files (x86)\\Internet Explorer\\iexplore.exe".to_string(),
            "C:\\Program Files\\Microsoft Office\\*".to_string(),
            "C:\\Program Files (x86)\\Microsoft Office\\*".to_string(),
            "C:\\Program Files\\Windows Defender\\*".to_string(),
            "C:\\ProgramData\\Microsoft\\Windows Defender\\*".to_string(),
        ],
    }
}
