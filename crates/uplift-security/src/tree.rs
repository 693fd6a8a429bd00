use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::checksum::verify_sha256_reader;

/// Root-relative `/`-separated file path to lowercase sha256 hex.
pub type TreeDigest = BTreeMap<String, String>;

/// Hashes every regular file under `root`, skipping paths for which `skip`
/// returns true (directories are pruned as a whole).
pub fn digest_tree(root: &Path, skip: impl Fn(&str) -> bool) -> Result<TreeDigest> {
    let mut digest = TreeDigest::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            relative(root, entry.path()).map_or(true, |rel| rel.is_empty() || !skip(&rel))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("failed walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative(root, entry.path()) else {
            continue;
        };
        let file = File::open(entry.path())
            .with_context(|| format!("failed opening {}", entry.path().display()))?;
        let hash = verify_sha256_reader(&mut BufReader::new(file))
            .with_context(|| format!("failed hashing {}", entry.path().display()))?;
        digest.insert(rel, hash);
    }
    Ok(digest)
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(
        rel.components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
    )
}
