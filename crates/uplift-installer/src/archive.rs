use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use uplift_core::{is_suspicious_path, normalize_rel_path};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub extracted: Vec<String>,
    /// Entry names refused because they would land outside the destination.
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEntry {
    Directory(String),
    File { name: String, source: PathBuf },
    /// Stored as the link itself, never as the file it points to.
    Symlink { name: String, target: String },
}

pub trait Archiver {
    /// Entry names in archive order, without extracting anything. Directory
    /// entries end with `/`.
    fn entry_names(&self, archive: &Path) -> Result<Vec<String>>;
    fn extract(&self, archive: &Path, dst: &Path) -> Result<ExtractReport>;
    fn create(&self, archive: &Path, entries: &[ArchiveEntry]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiver;

fn open_zip(archive: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file =
        File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("failed to read zip archive {}", archive.display()))
}

impl Archiver for ZipArchiver {
    fn entry_names(&self, archive: &Path) -> Result<Vec<String>> {
        let mut zip = open_zip(archive)?;
        let mut names = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let entry = zip.by_index_raw(index).with_context(|| {
                format!("failed to read entry {index} of {}", archive.display())
            })?;
            names.push(entry.name().to_string());
        }
        Ok(names)
    }

    fn extract(&self, archive: &Path, dst: &Path) -> Result<ExtractReport> {
        let mut zip = open_zip(archive)?;
        fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;

        let mut report = ExtractReport::default();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).with_context(|| {
                format!("failed to read entry {index} of {}", archive.display())
            })?;
            let name = entry.name().to_string();
            if is_suspicious_path(&name) || entry.enclosed_name().is_none() {
                report.rejected.push(name);
                continue;
            }
            let rel = normalize_rel_path(&name);
            if rel.is_empty() {
                continue;
            }

            let target = dst.join(&rel);
            if is_symlink_mode(entry.unix_mode()) {
                let mut link = String::new();
                io::Read::read_to_string(&mut entry, &mut link)
                    .with_context(|| format!("failed to read link target of {name}"))?;
                if !link_stays_inside(&rel, &link) {
                    report.rejected.push(name);
                    continue;
                }
                create_symlink(&link, &target)?;
            } else if entry.is_dir() {
                fs::create_dir_all(&target)
                    .with_context(|| format!("failed to create {}", target.display()))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                let mut out = BufWriter::new(
                    File::create(&target)
                        .with_context(|| format!("failed to create {}", target.display()))?,
                );
                io::copy(&mut entry, &mut out)
                    .with_context(|| format!("failed to extract {name}"))?;

                #[cfg(unix)]
                if let Some(mode) = entry.unix_mode() {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                        .with_context(|| {
                            format!("failed to set permissions on {}", target.display())
                        })?;
                }
            }
            report.extracted.push(rel);
        }
        Ok(report)
    }

    fn create(&self, archive: &Path, entries: &[ArchiveEntry]) -> Result<()> {
        if let Some(parent) = archive.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = File::create(archive)
            .with_context(|| format!("failed to create {}", archive.display()))?;
        let mut writer = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in entries {
            match entry {
                ArchiveEntry::Directory(name) => {
                    writer
                        .add_directory(name.as_str(), options)
                        .with_context(|| format!("failed to add directory {name}"))?;
                }
                ArchiveEntry::Symlink { name, target } => {
                    writer
                        .add_symlink(name.as_str(), target.as_str(), options)
                        .with_context(|| format!("failed to add symlink {name}"))?;
                }
                ArchiveEntry::File { name, source } => {
                    let mut file_options = options;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        if let Ok(metadata) = fs::metadata(source) {
                            file_options =
                                file_options.unix_permissions(metadata.permissions().mode());
                        }
                    }
                    writer
                        .start_file(name.as_str(), file_options)
                        .with_context(|| format!("failed to add file {name}"))?;
                    let mut input = BufReader::new(File::open(source).with_context(|| {
                        format!("failed to open {}", source.display())
                    })?);
                    io::copy(&mut input, &mut writer)
                        .with_context(|| format!("failed to write {name}"))?;
                }
            }
        }
        writer
            .finish()
            .with_context(|| format!("failed to finish {}", archive.display()))?;
        Ok(())
    }
}

/// Packs every directory and file under `src` into `archive`, named by their
/// `/`-separated path relative to `src`.
pub fn archive_directory(archiver: &dyn Archiver, src: &Path, archive: &Path) -> Result<usize> {
    let mut entries = Vec::new();
    let mut files = 0;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to read {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| anyhow!("walked outside {}", src.display()))?;
        let name = rel
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if entry.path_is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("failed to read symlink {}", entry.path().display()))?;
            entries.push(ArchiveEntry::Symlink {
                name,
                target: target.to_string_lossy().replace('\\', "/"),
            });
        } else if entry.file_type().is_dir() {
            entries.push(ArchiveEntry::Directory(format!("{name}/")));
        } else {
            entries.push(ArchiveEntry::File {
                name,
                source: entry.path().to_path_buf(),
            });
            files += 1;
        }
    }
    archiver.create(archive, &entries)?;
    Ok(files)
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

fn is_symlink_mode(mode: Option<u32>) -> bool {
    mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK)
}

/// True when a link stored at `rel` with `target` resolves inside the
/// extraction root.
pub(crate) fn link_stays_inside(rel: &str, target: &str) -> bool {
    let target = target.replace('\\', "/");
    let bytes = target.as_bytes();
    let drive_rooted = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if target.is_empty() || target.starts_with('/') || drive_rooted {
        return false;
    }
    let mut depth = rel.split('/').count().saturating_sub(1);
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => match depth.checked_sub(1) {
                Some(parent) => depth = parent,
                None => return false,
            },
            _ => depth += 1,
        }
    }
    true
}

#[cfg(unix)]
fn create_symlink(link: &str, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::os::unix::fs::symlink(link, target)
        .with_context(|| format!("failed to create symlink {} -> {link}", target.display()))
}

#[cfg(not(unix))]
fn create_symlink(link: &str, target: &Path) -> Result<()> {
    Err(anyhow!(
        "symlink entries are not supported on this platform: {} -> {link}",
        target.display()
    ))
}
