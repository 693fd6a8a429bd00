use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::version::parse_lenient_version;

/// File name of the manifest shipped at the root of an update artifact.
pub const MANIFEST_FILE_NAME: &str = "update.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateManifest {
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "archive", alias = "archive_ref")]
    pub archive: String,
    #[serde(default, rename = "vendor_update", alias = "dependency_update")]
    pub dependency_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, rename = "script", skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
}

impl UpdateManifest {
    pub fn from_json_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self =
            serde_json::from_str(input).context("failed to parse update manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let version = self.version.trim();
        if !version.is_empty() && parse_lenient_version(version).is_none() {
            return Err(anyhow!("update manifest version is not a version: {version}"));
        }
        if self.archive.contains("..") {
            return Err(anyhow!(
                "update manifest archive must not contain parent segments: {}",
                self.archive
            ));
        }
        if let Some(sha256) = &self.sha256 {
            if sha256.len() != 64 || !sha256.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(anyhow!("update manifest sha256 must be 64 hex characters"));
            }
        }
        Ok(())
    }

    pub fn has_version(&self) -> bool {
        !self.version.trim().is_empty()
    }

    /// Fills fields left empty here from `fallback`. Values already set win.
    pub fn merged_with(&self, fallback: &UpdateManifest) -> UpdateManifest {
        UpdateManifest {
            version: if self.has_version() {
                self.version.clone()
            } else {
                fallback.version.clone()
            },
            archive: if self.archive.is_empty() {
                fallback.archive.clone()
            } else {
                self.archive.clone()
            },
            dependency_update: self.dependency_update || fallback.dependency_update,
            description: self
                .description
                .clone()
                .or_else(|| fallback.description.clone()),
            sha256: self.sha256.clone().or_else(|| fallback.sha256.clone()),
            script_name: self
                .script_name
                .clone()
                .or_else(|| fallback.script_name.clone()),
        }
    }
}
