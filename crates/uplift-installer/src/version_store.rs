use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uplift_core::{current_timestamp, is_newer_version, AppLayout, LogEntry, VersionRecord};

/// Reads and writes `version.json`. Every call goes back to disk so that
/// nothing is cached between operations.
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_layout(layout: &AppLayout) -> Self {
        Self::new(layout.version_record_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record, creating it with the default version when absent.
    pub fn load(&self) -> Result<VersionRecord> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).with_context(|| {
                format!("failed parsing version record: {}", self.path.display())
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let record = VersionRecord::default();
                self.save(&record)?;
                Ok(record)
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed reading version record: {}", self.path.display())),
        }
    }

    pub fn save(&self, record: &VersionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let encoded =
            serde_json::to_string_pretty(record).context("failed encoding version record")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, format!("{encoded}\n"))
            .with_context(|| format!("failed writing version record: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed replacing version record: {}", self.path.display())
        })
    }

    pub fn current_version(&self) -> Result<String> {
        Ok(self.load()?.version)
    }

    pub fn set_recovery_path(&self, container: &Path) -> Result<()> {
        let mut record = self.load()?;
        record.recovery_path = Some(container.display().to_string());
        self.save(&record)
    }

    /// Stamps a successful install. The version only moves forward; the
    /// returned flag says whether it changed.
    pub fn record_success(&self, version: Option<&str>, entry: LogEntry) -> Result<bool> {
        let mut record = self.load()?;
        let advanced = match version {
            Some(version) if is_newer_version(version, &record.version) => {
                record.version = version.trim().to_string();
                true
            }
            _ => false,
        };
        record.last_update = Some(current_timestamp());
        record.logs = Some(entry);
        self.save(&record)?;
        Ok(advanced)
    }

    pub fn record_log(&self, entry: LogEntry) -> Result<()> {
        let mut record = self.load()?;
        record.logs = Some(entry);
        self.save(&record)
    }
}
