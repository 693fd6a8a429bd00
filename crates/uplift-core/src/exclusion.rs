use std::path::{Component, Path};

use crate::config::DEFAULT_EXCLUDED_PATHS;
use crate::layout::{AppLayout, VERSION_RECORD_FILE_NAME};

/// Path prefixes, relative to the application root, that no updater step may
/// overwrite or capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    prefixes: Vec<String>,
}

impl ExclusionSet {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for entry in entries {
            set.insert(entry.as_ref());
        }
        set
    }

    /// Defaults, then the configured entries, then the updater's own state and
    /// download directories and its version record.
    pub fn for_layout(configured: &[String], layout: &AppLayout) -> Self {
        let mut set = Self::new(DEFAULT_EXCLUDED_PATHS);
        for entry in configured {
            set.insert(entry);
        }
        set.insert(layout.state_rel());
        set.insert(layout.download_rel());
        set.insert(VERSION_RECORD_FILE_NAME);
        set
    }

    pub fn insert(&mut self, entry: &str) {
        let normalized = normalize_rel_path(entry);
        if normalized.is_empty() || self.prefixes.contains(&normalized) {
            return;
        }
        self.prefixes.push(normalized);
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn is_excluded(&self, rel_path: &str) -> bool {
        let normalized = normalize_rel_path(rel_path);
        if normalized.is_empty() {
            return false;
        }
        self.prefixes.iter().any(|prefix| {
            normalized == *prefix
                || normalized
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Like [`ExclusionSet::is_excluded`] for a path under `root`. Paths
    /// outside the root are never excluded.
    pub fn is_excluded_path(&self, root: &Path, path: &Path) -> bool {
        relative_to(root, path).is_some_and(|rel| self.is_excluded(&rel))
    }
}

pub fn normalize_rel_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized.trim_matches('/').to_string()
}

/// Archive entry names that would escape the extraction root.
pub fn is_suspicious_path(name: &str) -> bool {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return true;
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    normalized.split('/').any(|segment| segment == "..")
}

/// Root-relative `/`-separated form of `path`, or `None` when it is not under
/// `root`.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(segments.join("/"))
}
