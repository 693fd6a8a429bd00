use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uplift_core::{current_timestamp, AppLayout, OperationContext, UpdateError};

use crate::process::{shell_command, ProcessRunner};

/// Exclusive claim on the application for the duration of one operation.
///
/// The marker file is created with create-new semantics so a second claimant
/// fails instead of waiting. Dropping the guard without [`exit`] still removes
/// the marker.
///
/// [`exit`]: MaintenanceWindow::exit
#[derive(Debug)]
pub struct MaintenanceWindow {
    marker: PathBuf,
    released: bool,
}

impl MaintenanceWindow {
    pub fn enter(
        ctx: &mut OperationContext,
        runner: &dyn ProcessRunner,
        operation: &str,
    ) -> Result<Self, UpdateError> {
        let marker = ctx.layout().maintenance_marker_path();
        claim_marker(&marker, operation)?;
        ctx.info(format!("Entered maintenance window for {operation}"));
        let window = Self {
            marker,
            released: false,
        };

        if let Some(command) = ctx.config().maintenance.enter_command.clone() {
            run_best_effort(ctx, runner, &command, "maintenance enter");
        }
        Ok(window)
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn exit(mut self, ctx: &mut OperationContext, runner: &dyn ProcessRunner) {
        if let Some(command) = ctx.config().maintenance.exit_command.clone() {
            run_best_effort(ctx, runner, &command, "maintenance exit");
        }
        match fs::remove_file(&self.marker) {
            Ok(()) => ctx.info("Exited maintenance window"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                ctx.info("Exited maintenance window")
            }
            Err(err) => ctx.warn(format!(
                "Failed to remove maintenance marker {}: {err}",
                self.marker.display()
            )),
        }
        self.released = true;
    }
}

impl Drop for MaintenanceWindow {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = fs::remove_file(&self.marker) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    marker = %self.marker.display(),
                    "failed to release maintenance marker: {err}"
                );
            }
        }
    }
}

fn claim_marker(marker: &Path, operation: &str) -> Result<(), UpdateError> {
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))
            .map_err(UpdateError::Config)?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(UpdateError::Busy {
                marker: marker.display().to_string(),
            });
        }
        Err(err) => {
            return Err(UpdateError::Config(anyhow::Error::new(err).context(format!(
                "failed to claim maintenance marker: {}",
                marker.display()
            ))));
        }
    };

    let written = file
        .write_all(
            format!(
                "pid={}\noperation={operation}\nstarted={}\n",
                std::process::id(),
                current_timestamp()
            )
            .as_bytes(),
        )
        .and_then(|()| file.flush());
    if let Err(err) = written {
        drop(file);
        let _ = fs::remove_file(marker);
        return Err(UpdateError::Config(anyhow::Error::new(err).context(format!(
            "failed to write maintenance marker: {}",
            marker.display()
        ))));
    }
    Ok(())
}

/// Contents of the maintenance marker when a window is currently held.
pub fn read_maintenance_marker(layout: &AppLayout) -> Result<Option<String>> {
    let path = layout.maintenance_marker_path();
    match fs::read_to_string(&path) {
        Ok(raw) => Ok(Some(raw.trim().to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err)
            .with_context(|| format!("failed to read maintenance marker: {}", path.display())),
    }
}

fn run_best_effort(
    ctx: &mut OperationContext,
    runner: &dyn ProcessRunner,
    command: &str,
    label: &str,
) {
    let spec = shell_command(command)
        .current_dir(ctx.layout().root())
        .timeout(ctx.config().command_timeout());
    match runner.run(&spec) {
        Ok(output) if output.success => ctx.info(format!("Ran {label} command: {command}")),
        Ok(output) => ctx.warn(format!(
            "{label} command failed ({}): {command}",
            output.describe_failure()
        )),
        Err(err) => ctx.warn(format!("{label} command failed: {err:#}")),
    }
}
