use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {}s", .timeout.as_secs())]
    Timeout { url: String, timeout: Duration },
    #[error("request to {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("failed writing download {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("snapshot failed: {0:#}")]
    Snapshot(anyhow::Error),
    #[error("install failed: {0:#}")]
    Install(anyhow::Error),
    #[error("recovery failed: {0:#}")]
    Recovery(anyhow::Error),
    #[error("another update operation holds the maintenance window ({marker})")]
    Busy { marker: String },
    #[error("operator {operator} is not allowed to perform updates")]
    PermissionDenied { operator: String },
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
}

/// Stage at which a transaction stopped before any live file changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortStage {
    Fetch,
    Snapshot,
}

impl fmt::Display for AbortStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => f.write_str("fetch"),
            Self::Snapshot => f.write_str("snapshot"),
        }
    }
}
