use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

mod dispatch;
mod render;

use dispatch::run_cli;

#[derive(Parser, Debug)]
#[command(name = "uplift")]
#[command(about = "Transactional in-place application updater", long_about = None)]
struct Cli {
    /// Application root to operate on.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Config file to use instead of `<root>/uplift.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Operator identity checked against `allowed_operators`.
    #[arg(long, global = true)]
    operator: Option<String>,
    /// Disable colors and progress bars.
    #[arg(long, global = true)]
    plain: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the update server whether a newer version exists.
    Check,
    /// Apply an update transactionally, rolling back on failure.
    Update {
        /// Archive name on the update server. Defaults to the one the server
        /// advertises.
        #[arg(conflicts_with = "file")]
        archive: Option<String>,
        /// Apply a local artifact instead of downloading one.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Version to record when the artifact carries no manifest.
        #[arg(long = "set-version")]
        version: Option<String>,
        /// Expected SHA-256 of the artifact.
        #[arg(long)]
        sha256: Option<String>,
        /// Replace the dependency directory from the artifact.
        #[arg(long)]
        dependency_update: bool,
    },
    /// Restore the most recent recovery container.
    Recover {
        #[arg(long)]
        container: Option<PathBuf>,
    },
    /// Install one package archive into the dependency directory.
    InstallPackage { package: String, archive: PathBuf },
    /// Exit successfully when the package directory exists.
    PackageExists { package: String },
    /// Run the configured cache-clear commands.
    ClearCache,
    /// Verify license details with the update server.
    VerifyLicense {
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Show the installed version and maintenance state.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print a shell completion script.
    Completions { shell: Shell },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("UPLIFT_LOG").unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli)
}
