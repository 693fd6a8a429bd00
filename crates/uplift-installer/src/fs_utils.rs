use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Filesystem mutations performed against the live tree and scratch space.
pub trait FileSystem {
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    /// Copies one file, creating missing parent directories and overwriting
    /// the destination.
    fn copy_file(&self, src: &Path, dst: &Path) -> Result<()>;
    /// Succeeds when the file is already absent.
    fn remove_file(&self, path: &Path) -> Result<()>;
    /// Succeeds when the directory is already absent.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            self.create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            let metadata = fs::symlink_metadata(src)
                .with_context(|| format!("failed to stat {}", src.display()))?;
            if metadata.file_type().is_symlink() {
                let target = fs::read_link(src)
                    .with_context(|| format!("failed to read symlink {}", src.display()))?;
                remove_file_if_exists(dst)
                    .with_context(|| format!("failed to replace {}", dst.display()))?;
                return std::os::unix::fs::symlink(&target, dst).with_context(|| {
                    format!(
                        "failed to create symlink {} -> {}",
                        dst.display(),
                        target.display()
                    )
                });
            }
        }

        fs::copy(src, dst).with_context(|| {
            format!("failed to copy {} to {}", src.display(), dst.display())
        })?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        remove_file_if_exists(path).with_context(|| format!("failed to remove {}", path.display()))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).with_context(|| {
            format!("failed to move {} to {}", from.display(), to.display())
        })
    }
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Recursively copies `src` into `dst`. Entries for which `skip` returns true
/// are left out together with everything beneath them. Returns the number of
/// files copied.
pub fn copy_dir_filtered(
    fs: &dyn FileSystem,
    src: &Path,
    dst: &Path,
    skip: &dyn Fn(&Path) -> bool,
) -> Result<usize> {
    fs.create_dir_all(dst)?;
    let mut copied = 0;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !skip(entry.path()));
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to read {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("walked outside {}", src.display()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs.create_dir_all(&target)?;
        } else {
            fs.copy_file(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

