use std::fmt;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::config::UpdaterConfig;
use crate::exclusion::ExclusionSet;
use crate::layout::AppLayout;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[serde(alias = "warn")]
    Warning,
    #[serde(alias = "err")]
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    #[serde(default)]
    pub timestamp: String,
    pub message: String,
    #[serde(rename = "type")]
    pub severity: Severity,
}

impl LogEntry {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            message: message.into(),
            severity,
        }
    }
}

pub fn current_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Compact stamp used in file and directory names (`20240131_235959_123`).
pub fn file_stamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// State threaded through every step of one operation: the ordered log plus
/// the configuration, layout and exclusion set the step must honour.
#[derive(Debug, Clone)]
pub struct OperationContext {
    config: UpdaterConfig,
    layout: AppLayout,
    exclusions: ExclusionSet,
    log: Vec<LogEntry>,
}

impl OperationContext {
    pub fn new(config: UpdaterConfig, root: impl Into<PathBuf>) -> Self {
        let layout = AppLayout::from_config(root, &config);
        let exclusions = ExclusionSet::for_layout(&config.excluded_paths, &layout);
        Self {
            config,
            layout,
            exclusions,
            log: Vec::new(),
        }
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn layout(&self) -> &AppLayout {
        &self.layout
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        &self.exclusions
    }

    pub fn log(&mut self, severity: Severity, message: impl Into<String>) {
        let entry = LogEntry::new(severity, message);
        match severity {
            Severity::Info => tracing::info!(target: "uplift", "{}", entry.message),
            Severity::Warning => tracing::warn!(target: "uplift", "{}", entry.message),
            Severity::Error => tracing::error!(target: "uplift", "{}", entry.message),
        }
        self.log.push(entry);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(Severity::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(Severity::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(Severity::Error, message);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn last_entry(&self) -> Option<&LogEntry> {
        self.log.last()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.log
            .iter()
            .filter(|entry| entry.severity == severity)
            .count()
    }

    pub fn take_log(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.log)
    }
}
