use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uplift_core::{file_stamp, relative_to, OperationContext, UpdateManifest, MANIFEST_FILE_NAME};
use walkdir::WalkDir;

use crate::archive::Archiver;
use crate::dependency::{is_complete_bundle, swap_dependencies, swap_managed_paths};
use crate::fs_utils::FileSystem;
use crate::hook::run_hook;
use crate::process::{shell_command, ProcessRunner};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallSummary {
    pub manifest: UpdateManifest,
    pub directories_created: usize,
    pub files_copied: usize,
    pub dependencies_swapped: bool,
    pub hook_ran: bool,
    pub post_commands_failed: usize,
}

/// Applies an extracted artifact to the live tree.
pub struct Installer<'a> {
    fs: &'a dyn FileSystem,
    archiver: &'a dyn Archiver,
    runner: &'a dyn ProcessRunner,
}

impl<'a> Installer<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        archiver: &'a dyn Archiver,
        runner: &'a dyn ProcessRunner,
    ) -> Self {
        Self {
            fs,
            archiver,
            runner,
        }
    }

    /// The scratch directory is removed whatever happens; the archive only
    /// after a successful install.
    pub fn apply(
        &self,
        ctx: &mut OperationContext,
        archive: &Path,
        manifest: Option<&UpdateManifest>,
    ) -> Result<InstallSummary> {
        let extract_dir = ctx.layout().extract_dir(&file_stamp());
        let result = self.apply_from(ctx, archive, manifest, &extract_dir);
        if let Err(err) = self.fs.remove_dir_all(&extract_dir) {
            ctx.warn(format!("Failed to remove scratch directory: {err:#}"));
        }
        let summary = result?;

        self.fs.remove_file(archive)?;
        ctx.info("Cleaned up temporary files");
        Ok(summary)
    }

    fn apply_from(
        &self,
        ctx: &mut OperationContext,
        archive: &Path,
        manifest: Option<&UpdateManifest>,
        extract_dir: &Path,
    ) -> Result<InstallSummary> {
        ctx.info(format!("Extracting {}", archive.display()));
        self.fs.create_dir_all(extract_dir)?;
        let report = self
            .archiver
            .extract(archive, extract_dir)
            .with_context(|| format!("failed to extract {}", archive.display()))?;
        for name in &report.rejected {
            ctx.warn(format!("Skipping suspicious archive entry: {name}"));
        }

        let manifest = resolve_manifest(extract_dir, manifest)?;
        let swap = manifest.dependency_update && is_complete_bundle(ctx, extract_dir);
        if manifest.dependency_update && !swap {
            ctx.info(
                "Dependency update skipped; the artifact does not carry the dependency directory and descriptors",
            );
        }

        let plan = plan_copy(ctx, extract_dir, swap)?;
        let root = ctx.layout().root().to_path_buf();

        for rel in &plan.directories {
            self.fs
                .create_dir_all(&root.join(rel))
                .with_context(|| format!("failed to create directory {rel}"))?;
        }
        ctx.info(format!("Created {} directories", plan.directories.len()));

        for (source, rel) in &plan.files {
            self.fs
                .copy_file(source, &root.join(rel))
                .with_context(|| format!("failed to install {rel}"))?;
        }
        ctx.info(format!("Copied {} files", plan.files.len()));

        if swap {
            swap_dependencies(ctx, self.fs, self.runner, extract_dir)?;
        }

        let script_name = manifest
            .script_name
            .clone()
            .unwrap_or_else(|| ctx.config().script_filename.clone());
        let script = extract_dir.join(&script_name);
        let hook_ran = script.is_file();
        if hook_ran {
            run_hook(ctx, self.runner, &script)?;
            self.fs.remove_file(&script)?;
            self.fs.remove_file(&root.join(&script_name))?;
        }

        let post_commands_failed = self.run_post_commands(ctx);

        Ok(InstallSummary {
            manifest,
            directories_created: plan.directories.len(),
            files_copied: plan.files.len(),
            dependencies_swapped: swap,
            hook_ran,
            post_commands_failed,
        })
    }

    /// Failures are logged as warnings and never abort the install.
    fn run_post_commands(&self, ctx: &mut OperationContext) -> usize {
        let commands = ctx.config().post_update_commands.clone();
        let mut failed = 0;
        for command in commands {
            let spec = shell_command(&command)
                .current_dir(ctx.layout().root())
                .timeout(ctx.config().command_timeout());
            match self.runner.run(&spec) {
                Ok(output) if output.success => {
                    ctx.info(format!("Ran post-install command: {command}"))
                }
                Ok(output) => {
                    failed += 1;
                    ctx.warn(format!(
                        "Post-install command failed ({}): {command}",
                        output.describe_failure()
                    ));
                }
                Err(err) => {
                    failed += 1;
                    ctx.warn(format!("Post-install command failed: {err:#}"));
                }
            }
        }
        failed
    }
}

fn resolve_manifest(
    extract_dir: &Path,
    given: Option<&UpdateManifest>,
) -> Result<UpdateManifest> {
    let path = extract_dir.join(MANIFEST_FILE_NAME);
    let embedded = if path.is_file() {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {MANIFEST_FILE_NAME}"))?;
        Some(UpdateManifest::from_json_str(&raw)?)
    } else {
        None
    };
    Ok(match (given, embedded) {
        (Some(given), Some(embedded)) => given.merged_with(&embedded),
        (Some(given), None) => given.clone(),
        (None, Some(embedded)) => embedded,
        (None, None) => UpdateManifest::default(),
    })
}

#[derive(Debug, Default)]
struct CopyPlan {
    directories: Vec<String>,
    files: Vec<(PathBuf, String)>,
}

/// Walks the extracted tree and lists what lands in the live tree. Excluded
/// paths are pruned with everything under them; paths the dependency swap
/// owns are left out when a swap follows.
fn plan_copy(ctx: &OperationContext, extract_dir: &Path, swap: bool) -> Result<CopyPlan> {
    let managed = if swap {
        swap_managed_paths(ctx)
    } else {
        Vec::new()
    };
    let exclusions = ctx.exclusions();
    let skip = |rel: &str| {
        exclusions.is_excluded(rel)
            || managed
                .iter()
                .any(|path| rel == path || rel.starts_with(&format!("{path}/")))
    };

    let mut plan = CopyPlan::default();
    let walker = WalkDir::new(extract_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            relative_to(extract_dir, entry.path()).is_some_and(|rel| !skip(&rel))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to read {}", extract_dir.display()))?;
        let Some(rel) = relative_to(extract_dir, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            plan.directories.push(rel);
        } else if rel != MANIFEST_FILE_NAME {
            plan.files.push((entry.path().to_path_buf(), rel));
        }
    }
    plan.directories.sort();
    Ok(plan)
}
