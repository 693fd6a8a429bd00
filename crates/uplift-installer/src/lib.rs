mod archive;
mod dependency;
mod fs_utils;
mod hook;
mod install;
mod maintenance;
mod process;
mod recovery;
mod snapshot;
mod updater;
mod version_store;

pub use archive::{archive_directory, ArchiveEntry, Archiver, ExtractReport, ZipArchiver};
pub use dependency::{
    is_complete_bundle, swap_dependencies, swap_managed_paths, PackageInstaller, PackageSummary,
};
pub use fs_utils::{copy_dir_filtered, remove_file_if_exists, FileSystem, LocalFileSystem};
pub use hook::run_hook;
pub use install::{InstallSummary, Installer};
pub use maintenance::{read_maintenance_marker, MaintenanceWindow};
pub use process::{shell_command, CommandSpec, ProcessOutput, ProcessRunner, SystemProcessRunner};
pub use recovery::{resolve_container, RecoveryManager, RecoverySummary};
pub use snapshot::{minimal_targets, Snapshot, SnapshotManager, DATABASE_SECTION, FILES_SECTION};
pub use updater::{
    TransactionOutcome, TransactionReport, TransactionState, UpdateRequest, Updater,
    UpdaterStatus,
};
pub use version_store::VersionStore;

#[cfg(test)]
mod tests;
