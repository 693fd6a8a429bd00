use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::UpdaterConfig;

pub const VERSION_RECORD_FILE_NAME: &str = "version.json";
pub const MAINTENANCE_MARKER_FILE_NAME: &str = "maintenance.lock";
pub const RECOVERY_CONTAINER_PREFIX: &str = "recovery_";

/// Every path the updater touches, derived from the application root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLayout {
    root: PathBuf,
    state_rel: String,
    download_rel: String,
    dependency_rel: String,
}

impl AppLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_config(root, &UpdaterConfig::default())
    }

    pub fn from_config(root: impl Into<PathBuf>, config: &UpdaterConfig) -> Self {
        Self {
            root: root.into(),
            state_rel: trim_rel(&config.state_directory),
            download_rel: trim_rel(&config.tmp_directory),
            dependency_rel: trim_rel(&config.dependencies.directory),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root-relative state directory, `/`-separated.
    pub fn state_rel(&self) -> &str {
        &self.state_rel
    }

    pub fn download_rel(&self) -> &str {
        &self.download_rel
    }

    pub fn dependency_rel(&self) -> &str {
        &self.dependency_rel
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(&self.state_rel)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.state_dir().join("recovery")
    }

    pub fn maintenance_marker_path(&self) -> PathBuf {
        self.state_dir().join(MAINTENANCE_MARKER_FILE_NAME)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.root.join(&self.download_rel)
    }

    pub fn download_path(&self, archive_name: &str) -> PathBuf {
        self.download_dir().join(archive_name)
    }

    pub fn version_record_path(&self) -> PathBuf {
        self.root.join(VERSION_RECORD_FILE_NAME)
    }

    pub fn dependency_dir(&self) -> PathBuf {
        self.root.join(&self.dependency_rel)
    }

    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.dependency_dir().join(package)
    }

    pub fn extract_dir(&self, stamp: &str) -> PathBuf {
        self.work_dir().join(format!("extract-{stamp}"))
    }

    pub fn snapshot_work_dir(&self, stamp: &str) -> PathBuf {
        self.work_dir().join(format!("snapshot-{stamp}"))
    }

    pub fn recovery_extract_dir(&self, stamp: &str) -> PathBuf {
        self.work_dir().join(format!("recovery_extract_{stamp}"))
    }

    pub fn package_extract_dir(&self, stamp: &str) -> PathBuf {
        self.work_dir().join(format!("package-{stamp}"))
    }

    pub fn recovery_container_path(&self, stamp: &str) -> PathBuf {
        self.recovery_dir()
            .join(format!("{RECOVERY_CONTAINER_PREFIX}{stamp}.zip"))
    }

    /// `<root>/backup_<dir>_<stamp>/` holding the replaced dependency tree.
    pub fn dependency_backup_dir(&self, stamp: &str) -> PathBuf {
        let dir_name = self.dependency_rel.replace('/', "_");
        self.root.join(format!("backup_{dir_name}_{stamp}"))
    }

    /// `vendor/backup_<package>_<stamp>` with `/` in the package name flattened.
    pub fn package_backup_dir(&self, package: &str, stamp: &str) -> PathBuf {
        let flattened = package.replace(['/', '\\'], "_");
        self.dependency_dir()
            .join(format!("backup_{flattened}_{stamp}"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.state_dir(),
            self.work_dir(),
            self.recovery_dir(),
            self.download_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create dir: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn trim_rel(value: &str) -> String {
    value
        .replace('\\', "/")
        .trim_start_matches("./")
        .trim_matches('/')
        .to_string()
}
