use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uplift_core::{
    current_timestamp, file_stamp, is_suspicious_path, normalize_rel_path,
    OperationContext, MANIFEST_FILE_NAME, RECOVERY_CONTAINER_PREFIX,
};
use uplift_database::{Database, DatabaseSnapshotter};

use crate::archive::{archive_directory, Archiver};
use crate::fs_utils::{copy_dir_filtered, FileSystem};
use crate::version_store::VersionStore;

pub const FILES_SECTION: &str = "files";
pub const DATABASE_SECTION: &str = "database";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub created_at: String,
    pub container_path: PathBuf,
    pub files_captured: usize,
    pub database_dump: Option<String>,
}

/// Captures everything an artifact is about to overwrite into one recovery
/// container.
pub struct SnapshotManager<'a> {
    fs: &'a dyn FileSystem,
    archiver: &'a dyn Archiver,
    database: Option<&'a dyn Database>,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        archiver: &'a dyn Archiver,
        database: Option<&'a dyn Database>,
    ) -> Self {
        Self {
            fs,
            archiver,
            database,
        }
    }

    pub fn capture(&self, ctx: &mut OperationContext, archive: &Path) -> Result<Snapshot> {
        ctx.info(format!("Creating snapshot for {}", archive.display()));
        let names = self
            .archiver
            .entry_names(archive)
            .with_context(|| format!("failed to inspect {}", archive.display()))?;
        let mut accepted = Vec::with_capacity(names.len());
        for name in names {
            if is_suspicious_path(&name) {
                ctx.warn(format!("Ignoring suspicious archive entry: {name}"));
            } else {
                accepted.push(name);
            }
        }
        let targets = minimal_targets(&accepted);

        let stamp = file_stamp();
        let work_dir = ctx.layout().snapshot_work_dir(&stamp);
        let container = ctx.layout().recovery_container_path(&stamp);
        match self.build(ctx, &targets, &work_dir, &container) {
            Ok((files_captured, database_dump)) => {
                if let Err(err) = self.fs.remove_dir_all(&work_dir) {
                    ctx.warn(format!("Failed to remove snapshot working tree: {err:#}"));
                }
                VersionStore::for_layout(ctx.layout())
                    .set_recovery_path(&container)
                    .context("failed to record recovery pointer")?;
                self.prune_older_containers(ctx, &container);
                ctx.info(format!(
                    "Snapshot created: {} ({files_captured} files)",
                    container.display()
                ));
                Ok(Snapshot {
                    created_at: current_timestamp(),
                    container_path: container,
                    files_captured,
                    database_dump,
                })
            }
            Err(err) => {
                let _ = self.fs.remove_dir_all(&work_dir);
                let _ = self.fs.remove_file(&container);
                ctx.error(format!("Snapshot failed: {err:#}"));
                Err(err)
            }
        }
    }

    fn build(
        &self,
        ctx: &mut OperationContext,
        targets: &[String],
        work_dir: &Path,
        container: &Path,
    ) -> Result<(usize, Option<String>)> {
        let root = ctx.layout().root().to_path_buf();
        let files_dir = work_dir.join(FILES_SECTION);
        self.fs.create_dir_all(&files_dir)?;

        let mut files_captured = 0;
        for target in targets {
            if ctx.exclusions().is_excluded(target) {
                ctx.info(format!("Skipping excluded path: {target}"));
                continue;
            }
            let live = root.join(target);
            let copy = files_dir.join(target);
            let is_link = fs::symlink_metadata(&live)
                .is_ok_and(|meta| meta.file_type().is_symlink());
            if is_link || live.is_file() {
                self.fs
                    .copy_file(&live, &copy)
                    .with_context(|| format!("failed to back up {target}"))?;
                files_captured += 1;
            } else if live.is_dir() {
                let exclusions = ctx.exclusions();
                let skip = |path: &Path| exclusions.is_excluded_path(&root, path);
                files_captured += copy_dir_filtered(self.fs, &live, &copy, &skip)
                    .with_context(|| format!("failed to back up {target}"))?;
            }
        }

        let database_dump = self.backup_database(ctx, &work_dir.join(DATABASE_SECTION));

        let recovery_dir = ctx.layout().recovery_dir();
        self.fs.create_dir_all(&recovery_dir)?;
        archive_directory(self.archiver, work_dir, container)
            .with_context(|| format!("failed to build {}", container.display()))?;
        Ok((files_captured, database_dump))
    }

    fn backup_database(&self, ctx: &mut OperationContext, dir: &Path) -> Option<String> {
        let Some(database) = self.database else {
            ctx.info("No database configured; skipping database backup");
            return None;
        };
        let snapshotter = DatabaseSnapshotter::from_config(&ctx.config().database);
        match snapshotter.backup(database, dir) {
            Ok(summary) => {
                ctx.info(format!(
                    "Database backed up ({} tables, {} records)",
                    summary.tables, summary.records
                ));
                summary
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            }
            Err(err) => {
                let _ = self.fs.remove_dir_all(dir);
                ctx.warn(format!("Database backup failed: {err:#}"));
                None
            }
        }
    }

    fn prune_older_containers(&self, ctx: &mut OperationContext, keep: &Path) {
        let recovery_dir = ctx.layout().recovery_dir();
        let Ok(entries) = fs::read_dir(&recovery_dir) else {
            return;
        };
        let stale = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.as_path() != keep && is_recovery_container(path))
            .collect::<Vec<_>>();
        for path in stale {
            match self.fs.remove_file(&path) {
                Ok(()) => ctx.info(format!("Pruned old recovery container: {}", path.display())),
                Err(err) => ctx.warn(format!("Failed to prune {}: {err:#}", path.display())),
            }
        }
    }
}

pub(crate) fn is_recovery_container(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(RECOVERY_CONTAINER_PREFIX) && name.ends_with(".zip"))
}

/// Smallest set of root-relative paths that covers everything the archive
/// writes: every directory entry, the parent of every nested file, each
/// root-level file. Paths with an ancestor already in the set are dropped.
pub fn minimal_targets(entry_names: &[String]) -> Vec<String> {
    let mut candidates = BTreeSet::new();
    for name in entry_names {
        let is_dir = name.ends_with('/') || name.ends_with('\\');
        let rel = normalize_rel_path(name);
        if rel.is_empty() {
            continue;
        }
        if is_dir {
            candidates.insert(rel);
        } else if let Some((parent, _)) = rel.rsplit_once('/') {
            candidates.insert(parent.to_string());
        } else if rel != MANIFEST_FILE_NAME {
            candidates.insert(rel);
        }
    }

    candidates
        .iter()
        .filter(|candidate| !has_ancestor_in(candidate, &candidates))
        .cloned()
        .collect()
}

fn has_ancestor_in(path: &str, set: &BTreeSet<String>) -> bool {
    path.match_indices('/')
        .any(|(index, _)| set.contains(&path[..index]))
}
