use std::path::Path;

use anyhow::{anyhow, Context, Result};
use uplift_core::OperationContext;

use crate::process::{CommandSpec, ProcessRunner};

/// Runs the post-install hook through the configured interpreter in the
/// application root. A non-zero exit or a last stdout line of `false` fails
/// the install.
pub fn run_hook(
    ctx: &mut OperationContext,
    runner: &dyn ProcessRunner,
    script: &Path,
) -> Result<()> {
    let name = script
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.display().to_string());
    let spec = CommandSpec::from_argv(&ctx.config().hook_interpreter)?
        .arg(script.display().to_string())
        .current_dir(ctx.layout().root())
        .timeout(ctx.config().command_timeout());

    ctx.info(format!("Running upgrade script: {name}"));
    let output = runner
        .run(&spec)
        .with_context(|| format!("failed to run upgrade script {name}"))?;
    if !output.success {
        return Err(anyhow!(
            "upgrade script {name} failed ({})",
            output.describe_failure()
        ));
    }
    if output.last_stdout_line() == Some("false") {
        return Err(anyhow!("upgrade script {name} reported failure"));
    }
    ctx.info(format!("Upgrade script {name} completed"));
    Ok(())
}
