use std::any::Any;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use uplift_core::{
    AbortStage, FetchError, LogEntry, OperationContext, Severity, UpdateError, UpdateManifest,
    UpdaterConfig,
};
use uplift_database::{open_configured, Database, SqliteDatabase};
use uplift_remote::{
    ArchiveFetcher, HttpFetcher, LicenseRequest, LicenseVerdict, LicenseVerifier,
    ReqwestFetcher, UpdateCheck, UpdateChecker,
};
use uplift_security::verify_sha256_file;

use crate::archive::{Archiver, ZipArchiver};
use crate::dependency::{PackageInstaller, PackageSummary};
use crate::fs_utils::{FileSystem, LocalFileSystem};
use crate::install::Installer;
use crate::maintenance::{read_maintenance_marker, MaintenanceWindow};
use crate::process::{shell_command, ProcessRunner, SystemProcessRunner};
use crate::recovery::{resolve_container, RecoveryManager, RecoverySummary};
use crate::snapshot::SnapshotManager;
use crate::version_store::VersionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Downloading,
    Snapshotting,
    Installing,
    Completed,
    RollingBack,
    RolledBack,
    RecoveryFailed,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Snapshotting => "snapshotting",
            Self::Installing => "installing",
            Self::Completed => "completed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::RecoveryFailed => "recovery_failed",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Completed,
    Aborted(AbortStage),
    RolledBack,
    RecoveryFailed,
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Aborted(stage) => write!(f, "aborted during {stage}"),
            Self::RolledBack => f.write_str("rolled back"),
            Self::RecoveryFailed => f.write_str("recovery failed"),
        }
    }
}

/// Result of one update transaction, including its full ordered log.
#[derive(Debug)]
pub struct TransactionReport {
    pub outcome: TransactionOutcome,
    pub state_trail: Vec<TransactionState>,
    pub log: Vec<LogEntry>,
    pub version: Option<String>,
    pub error: Option<UpdateError>,
}

impl TransactionReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == TransactionOutcome::Completed
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.log
            .iter()
            .filter(|entry| entry.severity == severity)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRequest {
    /// Archive name relative to the configured update base URL.
    Remote {
        archive: String,
        manifest: Option<UpdateManifest>,
    },
    /// Artifact already on local disk.
    Local {
        path: PathBuf,
        manifest: Option<UpdateManifest>,
    },
}

impl UpdateRequest {
    pub fn manifest(&self) -> Option<&UpdateManifest> {
        match self {
            Self::Remote { manifest, .. } | Self::Local { manifest, .. } => manifest.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterStatus {
    pub version: String,
    pub last_update: Option<String>,
    pub last_log: Option<LogEntry>,
    pub maintenance: Option<String>,
    pub recovery_container: Option<PathBuf>,
}

/// Drives update transactions and the maintenance operations around them.
pub struct Updater {
    root: PathBuf,
    config: UpdaterConfig,
    fs: Box<dyn FileSystem>,
    archiver: Box<dyn Archiver>,
    http: Box<dyn HttpFetcher>,
    runner: Box<dyn ProcessRunner>,
    database: Option<Box<dyn Database>>,
}

impl Updater {
    pub fn new(root: impl Into<PathBuf>, config: UpdaterConfig) -> Result<Self> {
        config.validate()?;
        let http = ReqwestFetcher::new(config.request_timeout())
            .context("failed to build http client")?;
        Ok(Self {
            root: root.into(),
            config,
            fs: Box::new(LocalFileSystem),
            archiver: Box::new(ZipArchiver),
            http: Box::new(http),
            runner: Box::new(SystemProcessRunner),
            database: None,
        })
    }

    /// Loads `uplift.toml` from the application root.
    pub fn from_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = UpdaterConfig::load_from_root(&root)?;
        Self::new(root, config)
    }

    pub fn with_file_system(mut self, fs: impl FileSystem + 'static) -> Self {
        self.fs = Box::new(fs);
        self
    }

    pub fn with_archiver(mut self, archiver: impl Archiver + 'static) -> Self {
        self.archiver = Box::new(archiver);
        self
    }

    pub fn with_http(mut self, http: impl HttpFetcher + 'static) -> Self {
        self.http = Box::new(http);
        self
    }

    pub fn with_runner(mut self, runner: impl ProcessRunner + 'static) -> Self {
        self.runner = Box::new(runner);
        self
    }

    /// Uses `database` instead of opening the one named in `[database]`.
    pub fn with_database(mut self, database: impl Database + 'static) -> Self {
        self.database = Some(Box::new(database));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn context(&self) -> OperationContext {
        OperationContext::new(self.config.clone(), self.root.clone())
    }

    pub fn check_permission(&self, operator: Option<&str>) -> Result<(), UpdateError> {
        if self.config.allowed_operators.permits(operator) {
            return Ok(());
        }
        Err(UpdateError::PermissionDenied {
            operator: operator.unwrap_or("anonymous").to_string(),
        })
    }

    pub fn current_version(&self) -> Result<String, UpdateError> {
        VersionStore::for_layout(self.context().layout())
            .current_version()
            .map_err(UpdateError::Config)
    }

    pub fn check_for_update(&self, ctx: &mut OperationContext) -> Result<UpdateCheck, UpdateError> {
        let current = VersionStore::for_layout(ctx.layout())
            .current_version()
            .map_err(UpdateError::Config)?;
        UpdateChecker::new(self.http.as_ref())
            .check(ctx, &current)
            .map_err(UpdateError::Fetch)
    }

    /// Runs one full transaction. `Err` is returned only when the transaction
    /// could not start; every later failure is reported through the outcome.
    pub fn update(
        &self,
        request: UpdateRequest,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<TransactionReport, UpdateError> {
        let mut ctx = self.context();
        let window = MaintenanceWindow::enter(&mut ctx, self.runner.as_ref(), "update")?;
        let mut tx = Transaction::new(ctx);

        let (outcome, error) = self.run_transaction(&mut tx, &request, progress);

        if let Some(err) = &error {
            let entry = LogEntry::new(Severity::Error, err.to_string());
            if let Err(record_err) = VersionStore::for_layout(tx.ctx.layout()).record_log(entry) {
                tx.ctx
                    .warn(format!("Failed to record update log: {record_err:#}"));
            }
        }
        window.exit(&mut tx.ctx, self.runner.as_ref());

        let version = VersionStore::for_layout(tx.ctx.layout())
            .current_version()
            .ok();
        Ok(TransactionReport {
            outcome,
            state_trail: tx.trail,
            log: tx.ctx.take_log(),
            version,
            error,
        })
    }

    fn run_transaction(
        &self,
        tx: &mut Transaction,
        request: &UpdateRequest,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> (TransactionOutcome, Option<UpdateError>) {
        tx.transition(TransactionState::Downloading);
        let archive = match self.acquire(&mut tx.ctx, request, progress) {
            Ok(archive) => archive,
            Err(err) => {
                tx.ctx.error(format!("Update aborted: {err}"));
                return (
                    TransactionOutcome::Aborted(AbortStage::Fetch),
                    Some(UpdateError::Fetch(err)),
                );
            }
        };

        let opened = self.open_database(&mut tx.ctx);
        let database = self.database_ref(&opened);

        tx.transition(TransactionState::Snapshotting);
        let snapshot = match SnapshotManager::new(self.fs.as_ref(), self.archiver.as_ref(), database)
            .capture(&mut tx.ctx, &archive)
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tx.ctx.error("Update aborted before any file was changed");
                return (
                    TransactionOutcome::Aborted(AbortStage::Snapshot),
                    Some(UpdateError::Snapshot(err)),
                );
            }
        };

        tx.transition(TransactionState::Installing);
        let installer = Installer::new(
            self.fs.as_ref(),
            self.archiver.as_ref(),
            self.runner.as_ref(),
        );
        let installed = panic::catch_unwind(AssertUnwindSafe(|| {
            installer.apply(&mut tx.ctx, &archive, request.manifest())
        }))
        .unwrap_or_else(|payload| {
            Err(anyhow!("installer panicked: {}", panic_message(payload.as_ref())))
        });

        match installed {
            Ok(summary) => {
                let version = summary
                    .manifest
                    .has_version()
                    .then(|| summary.manifest.version.trim().to_string());
                let message = match &version {
                    Some(version) => format!("Update to version {version} completed"),
                    None => "Update completed".to_string(),
                };
                let store = VersionStore::for_layout(tx.ctx.layout());
                match store.record_success(version.as_deref(), LogEntry::new(Severity::Info, &message)) {
                    Ok(false) if version.is_some() => tx.ctx.info(
                        "Artifact version is not newer than the current version; version unchanged",
                    ),
                    Ok(_) => {}
                    Err(err) => tx
                        .ctx
                        .warn(format!("Failed to update version record: {err:#}")),
                }
                tx.ctx.info(message);
                tx.transition(TransactionState::Completed);
                (TransactionOutcome::Completed, None)
            }
            Err(err) => {
                tx.ctx.error(format!("Installation failed: {err:#}"));
                tx.transition(TransactionState::RollingBack);
                let recovery =
                    RecoveryManager::new(self.fs.as_ref(), self.archiver.as_ref(), database)
                        .restore(&mut tx.ctx, &snapshot.container_path);
                match recovery {
                    Ok(_) => {
                        tx.transition(TransactionState::RolledBack);
                        (TransactionOutcome::RolledBack, Some(UpdateError::Install(err)))
                    }
                    Err(recovery_err) => {
                        tx.transition(TransactionState::RecoveryFailed);
                        (
                            TransactionOutcome::RecoveryFailed,
                            Some(UpdateError::Recovery(
                                recovery_err.context(format!("install failed: {err:#}")),
                            )),
                        )
                    }
                }
            }
        }
    }

    /// Brings the artifact into the download directory and checks it is there.
    fn acquire(
        &self,
        ctx: &mut OperationContext,
        request: &UpdateRequest,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<PathBuf, FetchError> {
        let expected = request.manifest().and_then(|manifest| manifest.sha256.clone());
        let archive = match request {
            UpdateRequest::Remote { archive, .. } => ArchiveFetcher::new(self.http.as_ref())
                .fetch(ctx, archive, expected.as_deref(), progress)?,
            UpdateRequest::Local { path, .. } => stage_local(ctx, path, expected.as_deref())?,
        };

        let is_file = fs::metadata(&archive)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false);
        if !is_file {
            return Err(FetchError::Io {
                path: archive.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "artifact is missing or empty",
                ),
            });
        }
        Ok(archive)
    }

    fn open_database(&self, ctx: &mut OperationContext) -> Option<SqliteDatabase> {
        if self.database.is_some() {
            return None;
        }
        match open_configured(&self.config.database, &self.root) {
            Ok(database) => database,
            Err(err) => {
                ctx.warn(format!("Database unavailable: {err:#}"));
                None
            }
        }
    }

    fn database_ref<'a>(&'a self, opened: &'a Option<SqliteDatabase>) -> Option<&'a dyn Database> {
        match (&self.database, opened) {
            (Some(database), _) => Some(database.as_ref()),
            (None, Some(database)) => Some(database),
            (None, None) => None,
        }
    }

    /// Restores from `container`, or from the container the version record
    /// points to.
    pub fn recover(
        &self,
        ctx: &mut OperationContext,
        container: Option<&Path>,
    ) -> Result<RecoverySummary, UpdateError> {
        let window = MaintenanceWindow::enter(ctx, self.runner.as_ref(), "recovery")?;
        let opened = self.open_database(ctx);
        let database = self.database_ref(&opened);
        let manager = RecoveryManager::new(self.fs.as_ref(), self.archiver.as_ref(), database);
        let result = match container {
            Some(container) => manager.restore(ctx, container),
            None => manager.recover(ctx),
        };
        window.exit(ctx, self.runner.as_ref());
        result.map_err(UpdateError::Recovery)
    }

    pub fn install_package(
        &self,
        ctx: &mut OperationContext,
        package: &str,
        archive: &Path,
    ) -> Result<PackageSummary, UpdateError> {
        let window = MaintenanceWindow::enter(ctx, self.runner.as_ref(), "package install")?;
        let result = PackageInstaller::new(self.fs.as_ref(), self.archiver.as_ref())
            .install(ctx, package, archive);
        if let Err(err) = &result {
            ctx.error(format!("Package installation failed: {err:#}"));
        }
        window.exit(ctx, self.runner.as_ref());
        result.map_err(UpdateError::Install)
    }

    pub fn package_exists(&self, ctx: &OperationContext, package: &str) -> bool {
        PackageInstaller::exists(ctx, package)
    }

    /// Runs the configured cache-clear commands. Failures are warnings; the
    /// number of failed commands is returned.
    pub fn clear_cache(&self, ctx: &mut OperationContext) -> usize {
        let commands = self.config.cache_clear_commands.clone();
        let mut failed = 0;
        for command in commands {
            let spec = shell_command(&command)
                .current_dir(&self.root)
                .timeout(self.config.command_timeout());
            match self.runner.run(&spec) {
                Ok(output) if output.success => ctx.info(format!("Ran: {command}")),
                Ok(output) => {
                    failed += 1;
                    ctx.warn(format!(
                        "Cache command failed ({}): {command}",
                        output.describe_failure()
                    ));
                }
                Err(err) => {
                    failed += 1;
                    ctx.warn(format!("Cache command failed: {err:#}"));
                }
            }
        }
        if failed == 0 {
            ctx.info("Cache cleared successfully");
        }
        failed
    }

    /// Verifies `request`, or the `[license]` section when none is given.
    pub fn verify_license(
        &self,
        ctx: &mut OperationContext,
        request: Option<LicenseRequest>,
    ) -> Result<LicenseVerdict, UpdateError> {
        let request = match request {
            Some(request) => request,
            None => self
                .config
                .license
                .as_ref()
                .map(LicenseRequest::from)
                .ok_or_else(|| UpdateError::Config(anyhow!("no [license] section configured")))?,
        };
        LicenseVerifier::new(self.http.as_ref())
            .verify(ctx, &request)
            .map_err(UpdateError::Fetch)
    }

    pub fn status(&self, ctx: &mut OperationContext) -> Result<UpdaterStatus, UpdateError> {
        let record = VersionStore::for_layout(ctx.layout())
            .load()
            .map_err(UpdateError::Config)?;
        let maintenance = read_maintenance_marker(ctx.layout()).map_err(UpdateError::Config)?;
        let recovery_container = resolve_container(ctx).ok();
        Ok(UpdaterStatus {
            version: record.version,
            last_update: record.last_update,
            last_log: record.logs,
            maintenance,
            recovery_container,
        })
    }
}

struct Transaction {
    ctx: OperationContext,
    trail: Vec<TransactionState>,
}

impl Transaction {
    fn new(ctx: OperationContext) -> Self {
        Self {
            ctx,
            trail: vec![TransactionState::Idle],
        }
    }

    fn transition(&mut self, next: TransactionState) {
        let current = self.trail.last().copied().unwrap_or(TransactionState::Idle);
        self.ctx.info(format!("Transaction state: {current} -> {next}"));
        self.trail.push(next);
    }
}

/// Copies a local artifact into the download directory so the install step
/// can consume it like a downloaded one.
fn stage_local(
    ctx: &mut OperationContext,
    path: &Path,
    expected_sha256: Option<&str>,
) -> Result<PathBuf, FetchError> {
    let io_error = |path: &Path, source: std::io::Error| FetchError::Io {
        path: path.display().to_string(),
        source,
    };
    let file_name = path
        .file_name()
        .filter(|_| path.is_file())
        .ok_or_else(|| {
            io_error(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "update file not found"),
            )
        })?;

    if let Some(expected) = expected_sha256 {
        let (matches, actual) = verify_sha256_file(path, expected)
            .map_err(|err| io_error(path, std::io::Error::other(format!("{err:#}"))))?;
        if !matches {
            let err = FetchError::Checksum {
                path: path.display().to_string(),
                expected: expected.to_ascii_lowercase(),
                actual,
            };
            ctx.error(format!("Update file rejected: {err}"));
            return Err(err);
        }
        ctx.info("Update file checksum verified");
    }

    let download_dir = ctx.layout().download_dir();
    fs::create_dir_all(&download_dir).map_err(|source| io_error(&download_dir, source))?;
    let staged = download_dir.join(file_name);
    if !is_same_file(path, &staged) {
        fs::copy(path, &staged).map_err(|source| io_error(&staged, source))?;
    }
    ctx.info(format!("Using local update file: {}", path.display()));
    Ok(staged)
}

/// Compares resolved locations, so `a/../a/x.zip` and `a/x.zip` are the same file.
fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
