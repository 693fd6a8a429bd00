use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::CommandFactory;
use clap_complete::Shell;
use uplift_core::{UpdateManifest, UpdaterConfig};
use uplift_installer::{TransactionOutcome, UpdateRequest, Updater};
use uplift_remote::{LicenseRequest, UpdateCheck};

use crate::render::{
    current_output_style, format_report_summary, format_status_lines, outcome_status,
    status_json, TerminalRenderer,
};
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let renderer = TerminalRenderer::new(current_output_style(cli.plain));
    if let Commands::Completions { shell } = &cli.command {
        return write_completions_script(*shell, &mut std::io::stdout());
    }

    let updater = build_updater(&cli.root, cli.config.as_deref())?;
    let operator = cli.operator.as_deref();

    match cli.command {
        Commands::Check => {
            let mut ctx = updater.context();
            let result = updater.check_for_update(&mut ctx);
            renderer.print_log(ctx.entries());
            match result? {
                UpdateCheck::Available(manifest) => {
                    renderer.print_status(
                        "available",
                        &format!("version {} ({})", manifest.version, manifest.archive),
                    );
                    if let Some(description) = &manifest.description {
                        println!("{description}");
                    }
                }
                UpdateCheck::UpToDate { advertised } => {
                    let detail = advertised
                        .map(|version| format!(" (server advertises {version})"))
                        .unwrap_or_default();
                    renderer.print_status("ok", &format!("up to date{detail}"));
                }
                UpdateCheck::Disabled => {
                    renderer.print_status("skipped", "online update check is disabled")
                }
            }
        }
        Commands::Update {
            archive,
            file,
            version,
            sha256,
            dependency_update,
        } => {
            updater.check_permission(operator)?;
            let given = manifest_overrides(version, sha256, dependency_update);
            let request = match (archive, file) {
                (_, Some(path)) => UpdateRequest::Local {
                    path,
                    manifest: given,
                },
                (Some(archive), None) => UpdateRequest::Remote {
                    archive,
                    manifest: given,
                },
                (None, None) => {
                    let mut ctx = updater.context();
                    let result = updater.check_for_update(&mut ctx);
                    renderer.print_log(ctx.entries());
                    match result? {
                        UpdateCheck::Available(advertised) => UpdateRequest::Remote {
                            archive: advertised.archive.clone(),
                            manifest: Some(match given {
                                Some(given) => given.merged_with(&advertised),
                                None => advertised,
                            }),
                        },
                        UpdateCheck::UpToDate { .. } => {
                            renderer.print_status("ok", "already up to date");
                            return Ok(());
                        }
                        UpdateCheck::Disabled => {
                            return Err(anyhow!(
                                "online update check is disabled; pass an archive name or --file"
                            ));
                        }
                    }
                }
            };

            let mut progress = renderer.start_download();
            let report = updater.update(request, &mut |received, total| {
                progress.set(received, total)
            });
            progress.finish();
            let report = report?;

            renderer.print_section("update log");
            renderer.print_log(&report.log);
            renderer.print_status(outcome_status(report.outcome), &format_report_summary(&report));
            if report.outcome != TransactionOutcome::Completed {
                return Err(anyhow!("update {}", report.outcome));
            }
        }
        Commands::Recover { container } => {
            updater.check_permission(operator)?;
            let mut ctx = updater.context();
            let result = updater.recover(&mut ctx, container.as_deref());
            renderer.print_log(ctx.entries());
            let summary = result?;
            renderer.print_status(
                "completed",
                &format!(
                    "restored {} file(s) from {}",
                    summary.files_restored,
                    summary.container.display()
                ),
            );
        }
        Commands::InstallPackage { package, archive } => {
            updater.check_permission(operator)?;
            let mut ctx = updater.context();
            let result = updater.install_package(&mut ctx, &package, &archive);
            renderer.print_log(ctx.entries());
            let summary = result?;
            renderer.print_status(
                "completed",
                &format!(
                    "installed {package} into {} ({} file(s))",
                    summary.package_dir.display(),
                    summary.files_copied
                ),
            );
        }
        Commands::PackageExists { package } => {
            let ctx = updater.context();
            if updater.package_exists(&ctx, &package) {
                renderer.print_status("ok", &format!("{package} is installed"));
            } else {
                return Err(anyhow!("package {package} is not installed"));
            }
        }
        Commands::ClearCache => {
            updater.check_permission(operator)?;
            let mut ctx = updater.context();
            let failed = updater.clear_cache(&mut ctx);
            renderer.print_log(ctx.entries());
            if failed == 0 {
                renderer.print_status("ok", "cache cleared");
            } else {
                renderer.print_status("warning", &format!("{failed} cache command(s) failed"));
            }
        }
        Commands::VerifyLicense {
            key,
            email,
            name,
            domain,
        } => {
            let request = key.map(|key| LicenseRequest {
                key,
                email,
                name,
                domain,
            });
            let mut ctx = updater.context();
            let result = updater.verify_license(&mut ctx, request);
            renderer.print_log(ctx.entries());
            let verdict = result?;
            if verdict.valid {
                renderer.print_status("valid", "license verified");
            } else {
                renderer.print_status("invalid", &verdict.details.to_string());
                return Err(anyhow!("license rejected"));
            }
        }
        Commands::Status { json } => {
            let mut ctx = updater.context();
            let status = updater.status(&mut ctx)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status_json(&status))
                        .context("failed encoding status")?
                );
            } else {
                renderer.print_lines(&format_status_lines(&status));
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn build_updater(root: &Path, config: Option<&Path>) -> Result<Updater> {
    let config = match config {
        Some(path) => {
            if !path.exists() {
                return Err(anyhow!("config file not found: {}", path.display()));
            }
            UpdaterConfig::load(path)?
        }
        None => UpdaterConfig::load_from_root(root)?,
    };
    Updater::new(root, config)
}

fn manifest_overrides(
    version: Option<String>,
    sha256: Option<String>,
    dependency_update: bool,
) -> Option<UpdateManifest> {
    if version.is_none() && sha256.is_none() && !dependency_update {
        return None;
    }
    Some(UpdateManifest {
        version: version.unwrap_or_default(),
        sha256: sha256.map(|value| value.to_ascii_lowercase()),
        dependency_update,
        ..UpdateManifest::default()
    })
}

pub(crate) fn write_completions_script<W: Write>(shell: Shell, writer: &mut W) -> Result<()> {
    let mut command = Cli::command();
    let mut generated = Vec::new();
    clap_complete::generate(shell, &mut command, "uplift", &mut generated);
    writer
        .write_all(&generated)
        .context("failed writing generated completion script")?;
    Ok(())
}
