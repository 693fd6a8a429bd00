use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use uplift_core::{file_stamp, is_suspicious_path, normalize_rel_path, OperationContext};

use crate::archive::Archiver;
use crate::fs_utils::{copy_dir_filtered, FileSystem};
use crate::process::{CommandSpec, ProcessRunner};

/// True when the extracted artifact carries the dependency directory and
/// every descriptor file, which is what a full swap needs.
pub fn is_complete_bundle(ctx: &OperationContext, extract_dir: &Path) -> bool {
    let deps = &ctx.config().dependencies;
    extract_dir.join(ctx.layout().dependency_rel()).is_dir()
        && deps
            .descriptors
            .iter()
            .all(|descriptor| extract_dir.join(descriptor).is_file())
}

/// Root-relative paths the dependency swap owns during an install.
pub fn swap_managed_paths(ctx: &OperationContext) -> Vec<String> {
    std::iter::once(ctx.layout().dependency_rel().to_string())
        .chain(
            ctx.config()
                .dependencies
                .descriptors
                .iter()
                .map(|descriptor| normalize_rel_path(descriptor)),
        )
        .collect()
}

/// Replaces the live dependency directory and descriptors with the ones from
/// the extracted artifact, then runs the rebuild command. The previous tree is
/// kept under `backup_<dir>_<stamp>/` at the application root.
pub fn swap_dependencies(
    ctx: &mut OperationContext,
    fs: &dyn FileSystem,
    runner: &dyn ProcessRunner,
    extract_dir: &Path,
) -> Result<()> {
    let root = ctx.layout().root().to_path_buf();
    let dependency_rel = ctx.layout().dependency_rel().to_string();
    let descriptors = ctx.config().dependencies.descriptors.clone();
    let live_dir = ctx.layout().dependency_dir();
    let backup_dir = ctx.layout().dependency_backup_dir(&file_stamp());
    ctx.info(format!("Replacing the entire {dependency_rel} directory"));

    fs.create_dir_all(&backup_dir)?;
    if live_dir.is_dir() {
        copy_dir_filtered(fs, &live_dir, &backup_dir.join(&dependency_rel), &|_| false)
            .with_context(|| format!("failed to back up {dependency_rel}"))?;
    }
    for descriptor in &descriptors {
        let live = root.join(descriptor);
        if live.is_file() {
            fs.copy_file(&live, &backup_dir.join(descriptor))
                .with_context(|| format!("failed to back up {descriptor}"))?;
        }
    }
    ctx.info(format!(
        "Backed up {dependency_rel} and descriptors to: {}",
        backup_dir.display()
    ));

    fs.remove_dir_all(&live_dir)?;
    let exclusions = ctx.exclusions().clone();
    let skip = |path: &Path| {
        path.strip_prefix(extract_dir)
            .ok()
            .and_then(|rel| rel.to_str())
            .is_some_and(|rel| exclusions.is_excluded(rel))
    };
    copy_dir_filtered(fs, &extract_dir.join(&dependency_rel), &live_dir, &skip)
        .with_context(|| format!("failed to copy new {dependency_rel}"))?;
    ctx.info(format!("Copied new {dependency_rel} directory"));
    for descriptor in &descriptors {
        fs.copy_file(&extract_dir.join(descriptor), &root.join(descriptor))
            .with_context(|| format!("failed to replace {descriptor}"))?;
    }
    ctx.info(format!("Updated {}", descriptors.join(" and ")));

    rebuild_dependencies(ctx, runner)
}

fn rebuild_dependencies(ctx: &mut OperationContext, runner: &dyn ProcessRunner) -> Result<()> {
    let deps = ctx.config().dependencies.clone();
    if deps.rebuild_command.is_empty() {
        ctx.info("No dependency rebuild command configured");
        return Ok(());
    }
    let spec = CommandSpec::from_argv(&deps.rebuild_command)?
        .current_dir(ctx.layout().root())
        .timeout(deps.rebuild_timeout());

    ctx.info(format!("Running {}", spec.display()));
    let output = runner
        .run(&spec)
        .with_context(|| format!("failed to run {}", spec.display()))?;
    if !output.success {
        return Err(anyhow!(
            "dependency rebuild failed ({})",
            output.describe_failure()
        ));
    }
    ctx.info("Dependency rebuild completed successfully");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
    pub package_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub files_copied: usize,
}

/// Installs a single package archive into the dependency directory.
pub struct PackageInstaller<'a> {
    fs: &'a dyn FileSystem,
    archiver: &'a dyn Archiver,
}

impl<'a> PackageInstaller<'a> {
    pub fn new(fs: &'a dyn FileSystem, archiver: &'a dyn Archiver) -> Self {
        Self { fs, archiver }
    }

    pub fn install(
        &self,
        ctx: &mut OperationContext,
        package: &str,
        archive: &Path,
    ) -> Result<PackageSummary> {
        let package = validate_package_name(package)?;
        if !archive.is_file() {
            return Err(anyhow!("package file not found: {}", archive.display()));
        }

        let stamp = file_stamp();
        let extract_dir = ctx.layout().package_extract_dir(&stamp);
        let result = self.install_from(ctx, &package, archive, &extract_dir, &stamp);
        if let Err(err) = self.fs.remove_dir_all(&extract_dir) {
            ctx.warn(format!("Failed to remove package scratch space: {err:#}"));
        }
        let summary = result?;

        self.fs.remove_file(archive)?;
        ctx.info(format!("Package {package} installed successfully"));
        Ok(summary)
    }

    fn install_from(
        &self,
        ctx: &mut OperationContext,
        package: &str,
        archive: &Path,
        extract_dir: &Path,
        stamp: &str,
    ) -> Result<PackageSummary> {
        let report = self
            .archiver
            .extract(archive, extract_dir)
            .context("could not open the package archive")?;
        for name in &report.rejected {
            ctx.warn(format!("Skipping suspicious package entry: {name}"));
        }

        let package_dir = ctx.layout().package_dir(package);
        let backup_dir = if package_dir.is_dir() {
            let backup_dir = ctx.layout().package_backup_dir(package, stamp);
            self.fs.rename(&package_dir, &backup_dir)?;
            ctx.info(format!(
                "Backed up existing package to: {}",
                backup_dir.display()
            ));
            Some(backup_dir)
        } else {
            None
        };

        let package_root = detect_package_root(extract_dir, package)?;
        ctx.info(format!("Installing package to: {}", package_dir.display()));
        let files_copied = copy_dir_filtered(self.fs, &package_root, &package_dir, &|_| false)?;
        Ok(PackageSummary {
            package_dir,
            backup_dir,
            files_copied,
        })
    }

    pub fn exists(ctx: &OperationContext, package: &str) -> bool {
        validate_package_name(package)
            .map(|package| ctx.layout().package_dir(&package).is_dir())
            .unwrap_or(false)
    }
}

fn validate_package_name(package: &str) -> Result<String> {
    let normalized = normalize_rel_path(package);
    if normalized.is_empty() || is_suspicious_path(package) {
        return Err(anyhow!("invalid package name: '{package}'"));
    }
    Ok(normalized)
}

/// Archives commonly wrap the package in one top-level directory named after
/// it; use that directory as the root when present.
fn detect_package_root(extract_dir: &Path, package: &str) -> Result<PathBuf> {
    let base = package.rsplit('/').next().unwrap_or(package);
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(extract_dir)
        .with_context(|| format!("failed to read {}", extract_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            subdirs.push(entry.path());
        }
    }
    if let [only] = subdirs.as_slice() {
        let matches = only
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains(base));
        if matches {
            return Ok(only.clone());
        }
    }
    Ok(extract_dir.to_path_buf())
}
