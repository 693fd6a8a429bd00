use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use uplift_core::{file_stamp, is_suspicious_path, relative_to, OperationContext};
use uplift_database::{Database, DatabaseSnapshotter};
use walkdir::WalkDir;

use crate::archive::Archiver;
use crate::fs_utils::FileSystem;
use crate::snapshot::{is_recovery_container, DATABASE_SECTION, FILES_SECTION};
use crate::version_store::VersionStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    pub container: PathBuf,
    pub files_restored: usize,
    pub files_failed: usize,
    pub entries_skipped: usize,
    pub database_restored: bool,
}

/// Restores the live tree and database from a recovery container. Files an
/// install created that were absent at snapshot time are left in place.
pub struct RecoveryManager<'a> {
    fs: &'a dyn FileSystem,
    archiver: &'a dyn Archiver,
    database: Option<&'a dyn Database>,
}

impl<'a> RecoveryManager<'a> {
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

    /// Restores from the container named by the version record, falling back
    /// to the newest container in the recovery directory.
    pub fn recover(&self, ctx: &mut OperationContext) -> Result<RecoverySummary> {
        let container = resolve_container(ctx)?;
        self.restore(ctx, &container)
    }

    pub fn restore(&self, ctx: &mut OperationContext, container: &Path) -> Result<RecoverySummary> {
        if !container.is_file() {
            return Err(anyhow!(
                "recovery container not found: {}",
                container.display()
            ));
        }
        ctx.info(format!("Starting recovery from {}", container.display()));
        let scratch = ctx.layout().recovery_extract_dir(&file_stamp());
        let result = self.restore_from(ctx, container, &scratch);
        if let Err(err) = self.fs.remove_dir_all(&scratch) {
            ctx.warn(format!("Failed to remove recovery scratch space: {err:#}"));
        }
        match &result {
            Ok(summary) => ctx.info(format!(
                "Recovery completed ({} files restored)",
                summary.files_restored
            )),
            Err(err) => ctx.error(format!("Recovery failed: {err:#}")),
        }
        result
    }

    fn restore_from(
        &self,
        ctx: &mut OperationContext,
        container: &Path,
        scratch: &Path,
    ) -> Result<RecoverySummary> {
        self.fs.create_dir_all(scratch)?;
        let report = self
            .archiver
            .extract(container, scratch)
            .with_context(|| format!("failed to extract {}", container.display()))?;
        for name in &report.rejected {
            ctx.warn(format!("Skipping suspicious path in recovery container: {name}"));
        }

        let root = ctx.layout().root().to_path_buf();
        let files_dir = scratch.join(FILES_SECTION);
        let mut summary = RecoverySummary {
            container: container.to_path_buf(),
            files_restored: 0,
            files_failed: 0,
            entries_skipped: report.rejected.len(),
            database_restored: false,
        };

        if files_dir.is_dir() {
            for entry in WalkDir::new(&files_dir).min_depth(1).sort_by_file_name() {
                let entry =
                    entry.with_context(|| format!("failed to read {}", files_dir.display()))?;
                if entry.file_type().is_dir() {
                    continue;
                }
                let Some(rel) = relative_to(&files_dir, entry.path()) else {
                    continue;
                };
                if rel.is_empty() || is_suspicious_path(&rel) {
                    ctx.warn(format!("Skipping suspicious path in recovery container: {rel}"));
                    summary.entries_skipped += 1;
                    continue;
                }
                match self.fs.copy_file(entry.path(), &root.join(&rel)) {
                    Ok(()) => summary.files_restored += 1,
                    Err(err) => {
                        summary.files_failed += 1;
                        ctx.error(format!("Failed to restore {rel}: {err:#}"));
                    }
                }
            }
        }
        ctx.info(format!("Restored {} files", summary.files_restored));

        let database_dir = scratch.join(DATABASE_SECTION);
        match find_dump(&database_dir)? {
            Some(dump) => {
                let Some(database) = self.database else {
                    return Err(anyhow!(
                        "recovery container holds a database dump but no database is configured"
                    ));
                };
                let restored = DatabaseSnapshotter::from_config(&ctx.config().database)
                    .restore(database, &dump)?;
                ctx.info(format!(
                    "Database restored ({} tables, {} records)",
                    restored.tables, restored.records
                ));
                summary.database_restored = true;
            }
            None => ctx.info("No database dump in recovery container"),
        }

        if summary.files_failed > 0 {
            return Err(anyhow!(
                "{} file(s) could not be restored",
                summary.files_failed
            ));
        }
        Ok(summary)
    }
}

fn find_dump(database_dir: &Path) -> Result<Option<PathBuf>> {
    if !database_dir.is_dir() {
        return Ok(None);
    }
    let mut dumps = fs::read_dir(database_dir)
        .with_context(|| format!("failed to read {}", database_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    dumps.sort();
    Ok(dumps.pop())
}

/// Container named by the recovery pointer when it still exists, otherwise the
/// most recently modified container in the recovery directory.
pub fn resolve_container(ctx: &mut OperationContext) -> Result<PathBuf> {
    let record = VersionStore::for_layout(ctx.layout()).load()?;
    if let Some(pointer) = record.recovery_path.as_deref() {
        let pointer = PathBuf::from(pointer);
        if pointer.is_file() {
            return Ok(pointer);
        }
        ctx.warn(format!(
            "Recovery pointer {} no longer exists; looking for the newest container",
            pointer.display()
        ));
    }

    let recovery_dir = ctx.layout().recovery_dir();
    let entries = match fs::read_dir(&recovery_dir) {
        Ok(entries) => entries,
        Err(_) => return Err(anyhow!("no recovery container found")),
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_recovery_container(path))
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok()?;
            Some((modified, path))
        })
        .max()
        .map(|(_, path)| path)
        .ok_or_else(|| anyhow!("no recovery container found"))
}
