use semver::Version;
use serde::{Deserialize, Serialize};

use crate::context::LogEntry;

pub const DEFAULT_VERSION: &str = "1.0.0";

/// Persisted application version state, stored as `version.json` at the
/// application root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRecord {
    pub version: String,
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(default, deserialize_with = "deserialize_last_log")]
    pub logs: Option<LogEntry>,
    #[serde(default)]
    pub recovery_path: Option<String>,
}

impl Default for VersionRecord {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            last_update: None,
            logs: None,
            recovery_path: None,
        }
    }
}

// Older records store an empty string instead of a log object.
fn deserialize_last_log<'de, D>(deserializer: D) -> Result<Option<LogEntry>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Object(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// Parses `1`, `1.2`, `v1.2.3` and full semver strings.
pub fn parse_lenient_version(input: &str) -> Option<Version> {
    let trimmed = input.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(index) => trimmed.split_at(index),
        None => (trimmed, ""),
    };
    let mut parts = core.split('.').collect::<Vec<_>>();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

/// Returns true when `candidate` orders strictly after `current`. An unparseable
/// candidate never counts as newer.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    match (
        parse_lenient_version(candidate),
        parse_lenient_version(current),
    ) {
        (Some(candidate), Some(current)) => candidate > current,
        (Some(_), None) => true,
        _ => false,
    }
}
