use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use uplift_core::{
    AbortStage, AllowedOperators, DependencyConfig, LogEntry, OperationContext, Severity,
    UpdateError, UpdateManifest, UpdaterConfig, VersionRecord,
};
use uplift_database::SqliteDatabase;
use uplift_security::{digest_tree, TreeDigest};

use super::*;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "uplift-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent dir");
    }
    fs::write(path, contents).expect("must write test file");
}

fn read_file(path: &Path) -> String {
    fs::read_to_string(path).expect("must read test file")
}

fn quiet_config() -> UpdaterConfig {
    UpdaterConfig {
        post_update_commands: Vec::new(),
        cache_clear_commands: Vec::new(),
        ..UpdaterConfig::default()
    }
}

/// Application root with an existing 1.1.0 install.
fn seed_app(dir: &Path) -> PathBuf {
    let root = dir.join("app");
    write_file(&root.join(".env"), "APP_KEY=live\n");
    write_file(&root.join("storage/logs/app.log"), "live log\n");
    write_file(&root.join("bootstrap/cache/config.php"), "<?php // live cache\n");
    for index in 0..10 {
        write_file(
            &root.join(format!("app/Module{index}.php")),
            &format!("<?php // module {index} v1.1.0\n"),
        );
    }
    write_file(&root.join("routes/web.php"), "<?php // routes v1.1.0\n");
    let record = VersionRecord {
        version: "1.1.0".to_string(),
        ..VersionRecord::default()
    };
    VersionStore::new(root.join("version.json"))
        .save(&record)
        .expect("must seed version record");
    root
}

/// Builds a zip artifact from `(relative path, contents)` pairs.
fn build_artifact(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let src = dir.join(format!("{name}-src"));
    for (rel, contents) in files {
        write_file(&src.join(rel), contents);
    }
    let archive = dir.join("artifacts").join(name);
    archive_directory(&ZipArchiver, &src, &archive).expect("must build artifact");
    archive
}

fn release_1_2_0(dir: &Path) -> PathBuf {
    let modules = (0..10)
        .map(|index| {
            (
                format!("app/Module{index}.php"),
                format!("<?php // module {index} v1.2.0\n"),
            )
        })
        .collect::<Vec<_>>();
    let mut files = modules
        .iter()
        .map(|(rel, contents)| (rel.as_str(), contents.as_str()))
        .collect::<Vec<_>>();
    files.push((
        "update.json",
        r#"{"version":"1.2.0","archive":"update-1.2.0.zip","vendor_update":false,"description":"Release 1.2.0"}"#,
    ));
    build_artifact(dir, "update-1.2.0.zip", &files)
}

fn live_digest(root: &Path, ctx: &OperationContext) -> TreeDigest {
    digest_tree(root, |rel| {
        ctx.exclusions().is_excluded(rel)
    })
    .expect("must digest live tree")
}

fn local_request(path: &Path) -> UpdateRequest {
    UpdateRequest::Local {
        path: path.to_path_buf(),
        manifest: None,
    }
}

fn no_progress() -> impl FnMut(u64, Option<u64>) {
    |_, _| {}
}

fn scratch_is_empty(ctx: &OperationContext) -> bool {
    fs::read_dir(ctx.layout().work_dir())
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

fn recovery_containers(ctx: &OperationContext) -> Vec<PathBuf> {
    fs::read_dir(ctx.layout().recovery_dir())
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Clone, Default)]
struct FakeRunner {
    calls: Rc<RefCell<Vec<String>>>,
    failing: Vec<String>,
}

impl FakeRunner {
    fn failing_on(needle: &str) -> Self {
        Self {
            failing: vec![needle.to_string()],
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let line = spec.display();
        self.calls.borrow_mut().push(line.clone());
        let failed = self.failing.iter().any(|needle| line.contains(needle.as_str()));
        Ok(ProcessOutput {
            code: Some(if failed { 1 } else { 0 }),
            success: !failed,
            timed_out: false,
            stdout: String::new(),
            stderr: if failed {
                "command exploded".to_string()
            } else {
                String::new()
            },
        })
    }
}

/// Fails (or panics on) the Nth copy into the live tree, exactly once, so
/// that the restore that follows can succeed.
struct FaultyFileSystem {
    root: PathBuf,
    state_dir: PathBuf,
    fail_on: usize,
    panic_instead: bool,
    copies: Cell<usize>,
    fired: Cell<bool>,
}

impl FaultyFileSystem {
    fn new(ctx: &OperationContext, fail_on: usize) -> Self {
        Self {
            root: ctx.layout().root().to_path_buf(),
            state_dir: ctx.layout().state_dir(),
            fail_on,
            panic_instead: false,
            copies: Cell::new(0),
            fired: Cell::new(false),
        }
    }
}

impl FileSystem for FaultyFileSystem {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        LocalFileSystem.create_dir_all(path)
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let into_live_tree = dst.starts_with(&self.root) && !dst.starts_with(&self.state_dir);
        if into_live_tree && !self.fired.get() {
            let count = self.copies.get() + 1;
            self.copies.set(count);
            if count == self.fail_on {
                self.fired.set(true);
                if self.panic_instead {
                    panic!("injected panic copying {}", dst.display());
                }
                return Err(anyhow!("injected failure copying {}", dst.display()));
            }
        }
        LocalFileSystem.copy_file(src, dst)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        LocalFileSystem.remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        LocalFileSystem.remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        LocalFileSystem.rename(from, to)
    }
}

#[test]
fn minimal_targets_collapses_nested_entries() {
    let names = [
        "app/",
        "app/Http/",
        "app/Http/Kernel.php",
        "config/app.php",
        "config/cache/redis.php",
        "index.php",
        "update.json",
        "public/js/app.js",
    ]
    .map(str::to_string);
    assert_eq!(
        minimal_targets(&names),
        vec!["app", "config", "index.php", "public/js"]
    );
}

#[test]
fn minimal_targets_ignores_empty_names() {
    let names = ["./".to_string(), "/".to_string()];
    assert!(minimal_targets(&names).is_empty());
}

#[test]
fn snapshot_skips_excluded_paths_and_records_pointer() {
    let dir = test_dir();
    let root = seed_app(&dir);
    write_file(&root.join("app/secrets/key.pem"), "secret\n");
    let config = UpdaterConfig {
        excluded_paths: vec!["app/secrets".to_string()],
        ..quiet_config()
    };
    let mut ctx = OperationContext::new(config, &root);
    let artifact = build_artifact(
        &dir,
        "excluded.zip",
        &[
            (".env", "APP_KEY=new\n"),
            ("storage/logs/new.log", "new\n"),
            ("bootstrap/cache/config.php", "<?php // new cache\n"),
            ("app/Module0.php", "<?php // new\n"),
        ],
    );

    let snapshot = SnapshotManager::new(&LocalFileSystem, &ZipArchiver, None)
        .capture(&mut ctx, &artifact)
        .expect("must capture snapshot");

    let names = ZipArchiver
        .entry_names(&snapshot.container_path)
        .expect("must list container");
    assert!(names.contains(&"files/app/Module0.php".to_string()));
    assert!(names.contains(&"files/app/Module9.php".to_string()));
    assert!(names.iter().all(|name| !name.starts_with("files/.env")));
    assert!(names.iter().all(|name| !name.starts_with("files/storage")));
    assert!(names.iter().all(|name| !name.starts_with("files/bootstrap/cache")));
    assert!(names.iter().all(|name| !name.starts_with("files/app/secrets")));
    assert_eq!(snapshot.files_captured, 10);
    assert!(snapshot.database_dump.is_none());

    let record = VersionStore::for_layout(ctx.layout())
        .load()
        .expect("must load record");
    assert_eq!(
        record.recovery_path.as_deref(),
        Some(snapshot.container_path.display().to_string().as_str())
    );
    assert!(scratch_is_empty(&ctx));
    assert_eq!(ctx.count(Severity::Error), 0);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn snapshot_prunes_older_containers() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let stale = ctx.layout().recovery_container_path("20000101_000000_000");
    write_file(&stale, "old container");
    let artifact = build_artifact(&dir, "prune.zip", &[("routes/web.php", "new\n")]);

    let snapshot = SnapshotManager::new(&LocalFileSystem, &ZipArchiver, None)
        .capture(&mut ctx, &artifact)
        .expect("must capture snapshot");

    assert!(!stale.exists());
    assert_eq!(recovery_containers(&ctx), vec![snapshot.container_path]);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn snapshot_includes_database_section() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let database = SqliteDatabase::create(&root.join("database.sqlite")).expect("must create db");
    database
        .connection()
        .execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO users (name) VALUES ('ada'), ('grace');",
        )
        .expect("must seed db");
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(&dir, "db.zip", &[("routes/web.php", "new\n")]);

    let snapshot = SnapshotManager::new(&LocalFileSystem, &ZipArchiver, Some(&database))
        .capture(&mut ctx, &artifact)
        .expect("must capture snapshot");

    let dump = snapshot.database_dump.expect("must record dump name");
    assert!(dump.starts_with("database_backup_"));
    let names = ZipArchiver
        .entry_names(&snapshot.container_path)
        .expect("must list container");
    assert!(names.contains(&format!("database/{dump}")));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn install_respects_exclusions_and_skips_manifest() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(
        &dir,
        "install.zip",
        &[
            (".env", "APP_KEY=new\n"),
            ("storage/logs/new.log", "new\n"),
            ("bootstrap/cache/config.php", "<?php // new cache\n"),
            ("app/Module0.php", "<?php // module 0 new\n"),
            ("resources/views/home.blade.php", "home\n"),
            ("update.json", r#"{"version":"1.2.0"}"#),
        ],
    );

    let runner = FakeRunner::default();
    let summary = Installer::new(&LocalFileSystem, &ZipArchiver, &runner)
        .apply(&mut ctx, &artifact, None)
        .expect("must install");

    assert_eq!(read_file(&root.join(".env")), "APP_KEY=live\n");
    assert!(!root.join("storage/logs/new.log").exists());
    assert_eq!(
        read_file(&root.join("bootstrap/cache/config.php")),
        "<?php // live cache\n"
    );
    assert_eq!(
        read_file(&root.join("app/Module0.php")),
        "<?php // module 0 new\n"
    );
    assert!(root.join("resources/views/home.blade.php").is_file());
    assert!(!root.join("update.json").exists());
    assert_eq!(summary.files_copied, 2);
    assert_eq!(summary.manifest.version, "1.2.0");
    assert!(!artifact.exists());
    assert!(scratch_is_empty(&ctx));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn install_given_manifest_overrides_embedded_one() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(
        &dir,
        "merge.zip",
        &[
            ("routes/web.php", "new\n"),
            (
                "update.json",
                r#"{"version":"1.2.0","description":"embedded"}"#,
            ),
        ],
    );
    let given = UpdateManifest {
        version: "1.3.0".to_string(),
        ..UpdateManifest::default()
    };

    let summary = Installer::new(&LocalFileSystem, &ZipArchiver, &FakeRunner::default())
        .apply(&mut ctx, &artifact, Some(&given))
        .expect("must install");

    assert_eq!(summary.manifest.version, "1.3.0");
    assert_eq!(summary.manifest.description.as_deref(), Some("embedded"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn install_skips_entries_escaping_the_scratch_dir() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let payload = dir.join("payload.txt");
    write_file(&payload, "escaped\n");
    let artifact = dir.join("artifacts/traversal.zip");
    ZipArchiver
        .create(
            &artifact,
            &[
                ArchiveEntry::File {
                    name: "../../escape.txt".to_string(),
                    source: payload.clone(),
                },
                ArchiveEntry::File {
                    name: "routes/web.php".to_string(),
                    source: payload.clone(),
                },
            ],
        )
        .expect("must build traversal artifact");

    Installer::new(&LocalFileSystem, &ZipArchiver, &FakeRunner::default())
        .apply(&mut ctx, &artifact, None)
        .expect("must install safe entries");

    assert_eq!(read_file(&root.join("routes/web.php")), "escaped\n");
    assert!(!dir.join("escape.txt").exists());
    assert!(!root.join("escape.txt").exists());
    assert!(ctx
        .entries()
        .iter()
        .any(|entry| entry.severity == Severity::Warning
            && entry.message.contains("../../escape.txt")));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn recovery_rejects_entries_escaping_the_root() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let payload = dir.join("payload.txt");
    write_file(&payload, "restored\n");
    let container = ctx
        .layout()
        .recovery_container_path("20240101_000000_000");
    ZipArchiver
        .create(
            &container,
            &[
                ArchiveEntry::File {
                    name: "files/../../etc/passwd".to_string(),
                    source: payload.clone(),
                },
                ArchiveEntry::File {
                    name: "files/routes/web.php".to_string(),
                    source: payload.clone(),
                },
            ],
        )
        .expect("must build container");

    let summary = RecoveryManager::new(&LocalFileSystem, &ZipArchiver, None)
        .restore(&mut ctx, &container)
        .expect("must restore safe entries");

    assert_eq!(summary.files_restored, 1);
    assert_eq!(summary.entries_skipped, 1);
    assert_eq!(read_file(&root.join("routes/web.php")), "restored\n");
    assert!(!dir.join("etc/passwd").exists());
    assert!(!root.join("etc/passwd").exists());
    assert_eq!(ctx.count(Severity::Warning), 1);
    assert!(scratch_is_empty(&ctx));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn recover_prefers_pointer_then_newest_container() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);

    let build_container = |stamp: &str, contents: &str| {
        let src = dir.join(format!("container-{stamp}"));
        write_file(&src.join("files/routes/web.php"), contents);
        let container = ctx.layout().recovery_container_path(stamp);
        archive_directory(&ZipArchiver, &src, &container).expect("must build container");
        container
    };
    let older = build_container("20240101_000000_000", "older\n");
    let newer = build_container("20240102_000000_000", "newer\n");
    fs::File::options()
        .write(true)
        .open(&older)
        .and_then(|file| file.set_modified(SystemTime::now() - Duration::from_secs(3600)))
        .expect("must age older container");

    let manager = RecoveryManager::new(&LocalFileSystem, &ZipArchiver, None);
    let summary = manager.recover(&mut ctx).expect("must recover newest");
    assert_eq!(summary.container, newer);
    assert_eq!(read_file(&root.join("routes/web.php")), "newer\n");

    VersionStore::for_layout(ctx.layout())
        .set_recovery_path(&older)
        .expect("must set pointer");
    let summary = manager.recover(&mut ctx).expect("must recover from pointer");
    assert_eq!(summary.container, older);
    assert_eq!(read_file(&root.join("routes/web.php")), "older\n");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn recover_without_container_fails() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);

    let err = RecoveryManager::new(&LocalFileSystem, &ZipArchiver, None)
        .recover(&mut ctx)
        .expect_err("must fail without containers");
    assert!(err.to_string().contains("no recovery container"));

    let _ = fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn hook_reporting_false_fails_install() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(
        &dir,
        "hook-false.zip",
        &[
            ("routes/web.php", "new\n"),
            ("upgrade.sh", "echo migrating\necho false\n"),
        ],
    );

    let err = Installer::new(&LocalFileSystem, &ZipArchiver, &SystemProcessRunner)
        .apply(&mut ctx, &artifact, None)
        .expect_err("hook reporting false must fail");
    assert!(format!("{err:#}").contains("reported failure"));
    assert!(artifact.exists());

    let _ = fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn hook_with_non_zero_exit_fails_install() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(
        &dir,
        "hook-exit.zip",
        &[("upgrade.sh", "echo broken >&2\nexit 3\n")],
    );

    let err = Installer::new(&LocalFileSystem, &ZipArchiver, &SystemProcessRunner)
        .apply(&mut ctx, &artifact, None)
        .expect_err("non-zero hook must fail");
    let message = format!("{err:#}");
    assert!(message.contains("exit code 3"), "{message}");
    assert!(message.contains("broken"), "{message}");

    let _ = fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn successful_hook_is_removed_afterwards() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(
        &dir,
        "hook-ok.zip",
        &[("upgrade.sh", "touch hook-ran.txt\necho done\n")],
    );

    let summary = Installer::new(&LocalFileSystem, &ZipArchiver, &SystemProcessRunner)
        .apply(&mut ctx, &artifact, None)
        .expect("hook must succeed");

    assert!(summary.hook_ran);
    assert!(root.join("hook-ran.txt").is_file());
    assert!(!root.join("upgrade.sh").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn manifest_script_name_overrides_configured_hook() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(
        &dir,
        "hook-named.zip",
        &[
            ("migrate.sh", "echo ok\n"),
            ("update.json", r#"{"version":"1.2.0","script":"migrate.sh"}"#),
        ],
    );
    let runner = FakeRunner::default();

    let summary = Installer::new(&LocalFileSystem, &ZipArchiver, &runner)
        .apply(&mut ctx, &artifact, None)
        .expect("must install");

    assert!(summary.hook_ran);
    assert!(runner.calls()[0].starts_with("sh "));
    assert!(runner.calls()[0].ends_with("migrate.sh"));
    assert!(!root.join("migrate.sh").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn dependency_swap_replaces_directory_and_rebuilds() {
    let dir = test_dir();
    let root = seed_app(&dir);
    write_file(&root.join("vendor/old/Legacy.php"), "legacy\n");
    write_file(&root.join("composer.json"), "{\"old\":true}\n");
    write_file(&root.join("composer.lock"), "{\"old\":true}\n");
    let config = UpdaterConfig {
        dependencies: DependencyConfig {
            rebuild_command: vec!["composer".to_string(), "install".to_string()],
            ..DependencyConfig::default()
        },
        ..quiet_config()
    };
    let mut ctx = OperationContext::new(config, &root);
    let artifact = build_artifact(
        &dir,
        "vendor.zip",
        &[
            ("vendor/acme/lib/Lib.php", "lib\n"),
            ("composer.json", "{\"new\":true}\n"),
            ("composer.lock", "{\"new\":true}\n"),
            ("update.json", r#"{"version":"1.2.0","vendor_update":true}"#),
        ],
    );
    let runner = FakeRunner::default();

    let summary = Installer::new(&LocalFileSystem, &ZipArchiver, &runner)
        .apply(&mut ctx, &artifact, None)
        .expect("must swap dependencies");

    assert!(summary.dependencies_swapped);
    assert!(!root.join("vendor/old").exists());
    assert_eq!(read_file(&root.join("vendor/acme/lib/Lib.php")), "lib\n");
    assert_eq!(read_file(&root.join("composer.lock")), "{\"new\":true}\n");
    assert_eq!(runner.calls(), vec!["composer install".to_string()]);

    let backup = fs::read_dir(&root)
        .expect("must list root")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("backup_vendor_"))
        })
        .expect("must keep dependency backup");
    assert_eq!(read_file(&backup.join("vendor/old/Legacy.php")), "legacy\n");
    assert_eq!(read_file(&backup.join("composer.json")), "{\"old\":true}\n");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn incomplete_dependency_bundle_is_not_swapped() {
    let dir = test_dir();
    let root = seed_app(&dir);
    write_file(&root.join("vendor/old/Legacy.php"), "legacy\n");
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(
        &dir,
        "partial-vendor.zip",
        &[
            ("vendor/acme/lib/Lib.php", "lib\n"),
            ("composer.json", "{\"new\":true}\n"),
            ("update.json", r#"{"vendor_update":true}"#),
        ],
    );
    let runner = FakeRunner::default();

    let summary = Installer::new(&LocalFileSystem, &ZipArchiver, &runner)
        .apply(&mut ctx, &artifact, None)
        .expect("must install");

    assert!(!summary.dependencies_swapped);
    assert!(root.join("vendor/old/Legacy.php").is_file());
    assert!(root.join("vendor/acme/lib/Lib.php").is_file());
    assert!(runner.calls().is_empty());
    assert!(ctx
        .entries()
        .iter()
        .any(|entry| entry.message.contains("Dependency update skipped")));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn failed_dependency_rebuild_fails_install() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let artifact = build_artifact(
        &dir,
        "rebuild.zip",
        &[
            ("vendor/acme/lib/Lib.php", "lib\n"),
            ("composer.json", "{}\n"),
            ("composer.lock", "{}\n"),
            ("update.json", r#"{"vendor_update":true}"#),
        ],
    );

    let err = Installer::new(
        &LocalFileSystem,
        &ZipArchiver,
        &FakeRunner::failing_on("composer install"),
    )
    .apply(&mut ctx, &artifact, None)
    .expect_err("rebuild failure must fail install");
    assert!(format!("{err:#}").contains("dependency rebuild failed"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn package_install_backs_up_previous_copy() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let installer = PackageInstaller::new(&LocalFileSystem, &ZipArchiver);

    let first = build_artifact(
        &dir,
        "widgets-1.zip",
        &[("widgets/src/Widget.php", "v1\n")],
    );
    let summary = installer
        .install(&mut ctx, "acme/widgets", &first)
        .expect("must install package");
    assert!(summary.backup_dir.is_none());
    assert_eq!(
        read_file(&root.join("vendor/acme/widgets/src/Widget.php")),
        "v1\n"
    );
    assert!(!first.exists());

    let second = build_artifact(
        &dir,
        "widgets-2.zip",
        &[("widgets/src/Widget.php", "v2\n")],
    );
    let summary = installer
        .install(&mut ctx, "acme/widgets", &second)
        .expect("must reinstall package");
    let backup = summary.backup_dir.expect("must back up previous package");
    assert_eq!(read_file(&backup.join("src/Widget.php")), "v1\n");
    assert_eq!(
        read_file(&root.join("vendor/acme/widgets/src/Widget.php")),
        "v2\n"
    );

    assert!(PackageInstaller::exists(&ctx, "acme/widgets"));
    assert!(!PackageInstaller::exists(&ctx, "acme/missing"));
    assert!(!PackageInstaller::exists(&ctx, "../acme"));
    assert!(installer
        .install(&mut ctx, "../evil", &second)
        .is_err());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn version_store_only_moves_forward() {
    let dir = test_dir();
    let store = VersionStore::new(dir.join("version.json"));

    assert_eq!(store.current_version().expect("must create record"), "1.0.0");
    assert!(store.path().is_file());

    let advanced = store
        .record_success(Some("1.2.0"), LogEntry::new(Severity::Info, "updated"))
        .expect("must record success");
    assert!(advanced);
    let advanced = store
        .record_success(Some("1.1.0"), LogEntry::new(Severity::Info, "older"))
        .expect("must record success");
    assert!(!advanced);

    let record = store.load().expect("must load record");
    assert_eq!(record.version, "1.2.0");
    assert!(record.last_update.is_some());
    assert_eq!(
        record.logs.map(|entry| entry.message),
        Some("older".to_string())
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn maintenance_window_is_exclusive() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let mut ctx = OperationContext::new(quiet_config(), &root);
    let runner = FakeRunner::default();

    let window = MaintenanceWindow::enter(&mut ctx, &runner, "update").expect("must enter");
    let second = MaintenanceWindow::enter(&mut ctx, &runner, "recovery");
    assert!(matches!(second, Err(UpdateError::Busy { .. })));
    let marker = read_maintenance_marker(ctx.layout())
        .expect("must read marker")
        .expect("marker must exist");
    assert!(marker.contains("operation=update"));

    window.exit(&mut ctx, &runner);
    assert!(read_maintenance_marker(ctx.layout())
        .expect("must read marker")
        .is_none());

    {
        let _guard = MaintenanceWindow::enter(&mut ctx, &runner, "update").expect("must enter");
    }
    assert!(!ctx.layout().maintenance_marker_path().exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn update_is_rejected_while_window_is_held() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let marker = updater.context().layout().maintenance_marker_path();
    write_file(&marker, "pid=1\noperation=update\n");
    let artifact = release_1_2_0(&dir);

    let result = updater.update(local_request(&artifact), &mut no_progress());
    assert!(matches!(result, Err(UpdateError::Busy { .. })));
    assert!(marker.exists());
    assert_eq!(
        read_file(&root.join("app/Module0.php")),
        "<?php // module 0 v1.1.0\n"
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn end_to_end_update_from_1_1_0_to_1_2_0() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let config = UpdaterConfig {
        post_update_commands: vec![
            "php artisan migrate --force".to_string(),
            "php artisan view:clear".to_string(),
        ],
        ..quiet_config()
    };
    let runner = FakeRunner::failing_on("view:clear");
    let updater = Updater::new(&root, config)
        .expect("must build updater")
        .with_runner(runner.clone());
    let artifact = release_1_2_0(&dir);

    let report = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("transaction must start");

    assert_eq!(report.outcome, TransactionOutcome::Completed, "{report:?}");
    assert!(report.error.is_none());
    assert_eq!(
        report.state_trail,
        vec![
            TransactionState::Idle,
            TransactionState::Downloading,
            TransactionState::Snapshotting,
            TransactionState::Installing,
            TransactionState::Completed,
        ]
    );
    assert_eq!(report.count(Severity::Warning), 1, "{:#?}", report.log);
    assert_eq!(report.count(Severity::Error), 0, "{:#?}", report.log);
    assert_eq!(report.version.as_deref(), Some("1.2.0"));
    for index in 0..10 {
        assert_eq!(
            read_file(&root.join(format!("app/Module{index}.php"))),
            format!("<?php // module {index} v1.2.0\n")
        );
    }
    assert!(!root.join("update.json").exists());
    assert_eq!(runner.calls().len(), 2);

    let ctx = updater.context();
    let record = VersionStore::for_layout(ctx.layout())
        .load()
        .expect("must load record");
    assert_eq!(record.version, "1.2.0");
    assert!(record.last_update.is_some());
    assert!(record.recovery_path.is_some());
    assert!(!ctx.layout().maintenance_marker_path().exists());
    assert!(!ctx.layout().download_path("update-1.2.0.zip").exists());
    assert_eq!(recovery_containers(&ctx).len(), 1);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn running_the_same_update_twice_is_idempotent() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let artifact = release_1_2_0(&dir);
    let ctx = updater.context();

    let first = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("first run must start");
    assert!(first.succeeded(), "{first:?}");
    let after_first = live_digest(&root, &ctx);

    let second = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("second run must start");
    assert!(second.succeeded(), "{second:?}");
    let after_second = live_digest(&root, &ctx);

    assert_eq!(after_first, after_second);
    assert_eq!(second.version.as_deref(), Some("1.2.0"));
    assert_eq!(recovery_containers(&ctx).len(), 1);
    assert!(second
        .log
        .iter()
        .any(|entry| entry.message.contains("not newer")));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn failure_on_nth_file_rolls_back_to_identical_tree() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let database_path = dir.join("database.sqlite");
    {
        let database = SqliteDatabase::create(&database_path).expect("must create db");
        database
            .connection()
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT);
                 INSERT INTO items (label) VALUES ('a'), ('b'), ('c');",
            )
            .expect("must seed db");
    }
    let config = quiet_config();
    let ctx = OperationContext::new(config.clone(), &root);
    let before = live_digest(&root, &ctx);

    let updater = Updater::new(&root, config)
        .expect("must build updater")
        .with_runner(FakeRunner::default())
        .with_file_system(FaultyFileSystem::new(&ctx, 4))
        .with_database(SqliteDatabase::open(&database_path).expect("must open db"));
    let artifact = release_1_2_0(&dir);

    let report = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("transaction must start");

    assert_eq!(report.outcome, TransactionOutcome::RolledBack, "{report:?}");
    assert_eq!(
        report.state_trail[report.state_trail.len() - 2..],
        [TransactionState::RollingBack, TransactionState::RolledBack]
    );
    assert!(matches!(report.error, Some(UpdateError::Install(_))));
    assert_eq!(report.version.as_deref(), Some("1.1.0"));
    assert!(report
        .log
        .iter()
        .any(|entry| entry.message.contains("injected failure")));
    assert!(report
        .log
        .iter()
        .any(|entry| entry.message.contains("Database restored (1 tables, 3 records)")));
    assert_eq!(live_digest(&root, &ctx), before);
    assert!(!ctx.layout().maintenance_marker_path().exists());

    let record = VersionStore::for_layout(ctx.layout())
        .load()
        .expect("must load record");
    assert_eq!(record.version, "1.1.0");
    assert!(record.last_update.is_none());
    assert_eq!(
        record.logs.map(|entry| entry.severity),
        Some(Severity::Error)
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn installer_panic_is_caught_and_rolled_back() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let config = quiet_config();
    let ctx = OperationContext::new(config.clone(), &root);
    let before = live_digest(&root, &ctx);
    let mut fs_impl = FaultyFileSystem::new(&ctx, 2);
    fs_impl.panic_instead = true;

    let updater = Updater::new(&root, config)
        .expect("must build updater")
        .with_runner(FakeRunner::default())
        .with_file_system(fs_impl);
    let artifact = release_1_2_0(&dir);

    let report = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("transaction must start");

    assert_eq!(report.outcome, TransactionOutcome::RolledBack, "{report:?}");
    assert!(report
        .log
        .iter()
        .any(|entry| entry.message.contains("installer panicked")));
    assert_eq!(live_digest(&root, &ctx), before);
    assert!(!ctx.layout().maintenance_marker_path().exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn missing_local_artifact_aborts_during_fetch() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());

    let report = updater
        .update(local_request(&dir.join("missing.zip")), &mut no_progress())
        .expect("transaction must start");

    assert_eq!(
        report.outcome,
        TransactionOutcome::Aborted(AbortStage::Fetch)
    );
    assert!(matches!(report.error, Some(UpdateError::Fetch(_))));
    assert!(!updater
        .context()
        .layout()
        .maintenance_marker_path()
        .exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unreadable_artifact_aborts_before_touching_files() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let ctx = updater.context();
    let before = live_digest(&root, &ctx);
    let artifact = dir.join("artifacts/garbage.zip");
    write_file(&artifact, "this is not a zip archive");

    let report = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("transaction must start");

    assert_eq!(
        report.outcome,
        TransactionOutcome::Aborted(AbortStage::Snapshot)
    );
    assert!(matches!(report.error, Some(UpdateError::Snapshot(_))));
    assert_eq!(live_digest(&root, &ctx), before);
    assert!(recovery_containers(&ctx).is_empty());
    assert!(!ctx.layout().maintenance_marker_path().exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn local_checksum_mismatch_aborts_during_fetch() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let artifact = release_1_2_0(&dir);
    let request = UpdateRequest::Local {
        path: artifact,
        manifest: Some(UpdateManifest {
            sha256: Some("0".repeat(64)),
            ..UpdateManifest::default()
        }),
    };

    let report = updater
        .update(request, &mut no_progress())
        .expect("transaction must start");

    assert_eq!(
        report.outcome,
        TransactionOutcome::Aborted(AbortStage::Fetch)
    );
    assert!(matches!(
        report.error,
        Some(UpdateError::Fetch(uplift_core::FetchError::Checksum { .. }))
    ));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn permission_check_follows_allowed_operators() {
    let dir = test_dir();
    let updater = Updater::new(&dir, quiet_config()).expect("must build updater");
    assert!(updater.check_permission(Some("1")).is_ok());
    assert!(matches!(
        updater.check_permission(Some("2")),
        Err(UpdateError::PermissionDenied { .. })
    ));
    assert!(updater.check_permission(None).is_err());

    let open = UpdaterConfig {
        allowed_operators: AllowedOperators::Flag(false),
        ..quiet_config()
    };
    let updater = Updater::new(&dir, open).expect("must build updater");
    assert!(updater.check_permission(None).is_ok());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn clear_cache_reports_failures_as_warnings() {
    let dir = test_dir();
    let config = UpdaterConfig {
        cache_clear_commands: vec![
            "php artisan cache:clear".to_string(),
            "php artisan route:clear".to_string(),
        ],
        ..quiet_config()
    };
    let updater = Updater::new(&dir, config)
        .expect("must build updater")
        .with_runner(FakeRunner::failing_on("route:clear"));
    let mut ctx = updater.context();

    assert_eq!(updater.clear_cache(&mut ctx), 1);
    assert_eq!(ctx.count(Severity::Warning), 1);
    assert_eq!(ctx.count(Severity::Error), 0);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn status_reports_version_and_recovery_container() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let mut ctx = updater.context();

    let status = updater.status(&mut ctx).expect("must read status");
    assert_eq!(status.version, "1.1.0");
    assert!(status.maintenance.is_none());
    assert!(status.recovery_container.is_none());

    let artifact = release_1_2_0(&dir);
    let report = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("transaction must start");
    assert!(report.succeeded());

    let status = updater.status(&mut ctx).expect("must read status");
    assert_eq!(status.version, "1.2.0");
    assert!(status.recovery_container.is_some());
    assert!(status.last_log.is_some());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn recover_operation_holds_the_window() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let artifact = release_1_2_0(&dir);
    let report = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("transaction must start");
    assert!(report.succeeded());

    let mut ctx = updater.context();
    let summary = updater.recover(&mut ctx, None).expect("must recover");
    assert_eq!(summary.files_restored, 10);
    assert_eq!(
        read_file(&root.join("app/Module3.php")),
        "<?php // module 3 v1.1.0\n"
    );
    assert!(!ctx.layout().maintenance_marker_path().exists());

    let _ = fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn archive_keeps_symlinks_as_links() {
    let dir = test_dir();
    let src = dir.join("src");
    write_file(&src.join("storage/app/public/avatar.png"), "png\n");
    write_file(&src.join("public/index.php"), "<?php\n");
    std::os::unix::fs::symlink("../storage/app/public", src.join("public/storage"))
        .expect("must create symlink");
    let archive = dir.join("linked.zip");

    let files = archive_directory(&ZipArchiver, &src, &archive).expect("must archive tree");
    assert_eq!(files, 2);
    let names = ZipArchiver.entry_names(&archive).expect("must list entries");
    assert!(names.contains(&"public/storage".to_string()), "{names:?}");
    assert!(!names.iter().any(|name| name.starts_with("public/storage/")));

    let out = dir.join("out");
    let report = ZipArchiver.extract(&archive, &out).expect("must extract");
    assert!(report.rejected.is_empty(), "{report:?}");
    let link = out.join("public/storage");
    assert!(fs::symlink_metadata(&link)
        .expect("must stat link")
        .file_type()
        .is_symlink());
    assert_eq!(
        fs::read_link(&link).expect("must read link"),
        PathBuf::from("../storage/app/public")
    );
    assert_eq!(read_file(&link.join("avatar.png")), "png\n");

    let _ = fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn extraction_rejects_links_pointing_outside() {
    let dir = test_dir();
    let archive = dir.join("escaping.zip");
    ZipArchiver
        .create(
            &archive,
            &[
                ArchiveEntry::Symlink {
                    name: "public/etc".to_string(),
                    target: "../../etc".to_string(),
                },
                ArchiveEntry::Symlink {
                    name: "public/passwd".to_string(),
                    target: "/etc/passwd".to_string(),
                },
                ArchiveEntry::Symlink {
                    name: "public/storage".to_string(),
                    target: "../storage/app/public".to_string(),
                },
            ],
        )
        .expect("must build archive");

    let out = dir.join("out");
    let report = ZipArchiver.extract(&archive, &out).expect("must extract");
    assert_eq!(report.rejected, vec!["public/etc", "public/passwd"]);
    assert!(fs::symlink_metadata(out.join("public/etc")).is_err());
    assert!(fs::symlink_metadata(out.join("public/passwd")).is_err());
    assert!(fs::symlink_metadata(out.join("public/storage")).is_ok());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn link_targets_are_resolved_against_their_directory() {
    use crate::archive::link_stays_inside;

    assert!(link_stays_inside("public/storage", "../storage/app/public"));
    assert!(link_stays_inside("a/b/c", "../../x"));
    assert!(link_stays_inside("current", "./releases/7"));
    assert!(!link_stays_inside("public/storage", "../../storage"));
    assert!(!link_stays_inside("top", "../sibling"));
    assert!(!link_stays_inside("public/link", "/var/www"));
    assert!(!link_stays_inside("public/link", "C:/Windows"));
    assert!(!link_stays_inside("public/link", ""));
}

#[cfg(unix)]
#[test]
fn update_keeps_symlinked_public_storage() {
    let dir = test_dir();
    let root = seed_app(&dir);
    write_file(&root.join("public/index.php"), "<?php // front v1.1.0\n");
    write_file(&root.join("storage/app/public/avatar.png"), "png\n");
    std::os::unix::fs::symlink("../storage/app/public", root.join("public/storage"))
        .expect("must create symlink");
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let artifact = build_artifact(
        &dir,
        "update-1.2.0.zip",
        &[
            ("public/index.php", "<?php // front v1.2.0\n"),
            (
                "update.json",
                r#"{"version":"1.2.0","archive":"update-1.2.0.zip"}"#,
            ),
        ],
    );

    let report = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("transaction must start");

    assert_eq!(report.outcome, TransactionOutcome::Completed, "{report:?}");
    assert_eq!(read_file(&root.join("public/index.php")), "<?php // front v1.2.0\n");
    let link = root.join("public/storage");
    assert!(fs::symlink_metadata(&link)
        .expect("must stat link")
        .file_type()
        .is_symlink());
    assert_eq!(
        fs::read_link(&link).expect("must read link"),
        PathBuf::from("../storage/app/public")
    );
    let ctx = updater.context();
    let containers = recovery_containers(&ctx);
    assert_eq!(containers.len(), 1);
    let names = ZipArchiver
        .entry_names(&containers[0])
        .expect("must list container");
    assert!(names.contains(&"files/public/storage".to_string()), "{names:?}");
    assert!(names.contains(&"files/public/index.php".to_string()), "{names:?}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn artifact_version_record_does_not_replace_live_one() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let artifact = build_artifact(
        &dir,
        "update-1.2.0.zip",
        &[
            ("version.json", r#"{"version":"0.0.1"}"#),
            ("app/Module0.php", "<?php // module 0 v1.2.0\n"),
            (
                "update.json",
                r#"{"version":"1.2.0","archive":"update-1.2.0.zip"}"#,
            ),
        ],
    );

    let report = updater
        .update(local_request(&artifact), &mut no_progress())
        .expect("transaction must start");

    assert_eq!(report.outcome, TransactionOutcome::Completed, "{report:?}");
    assert_eq!(
        read_file(&root.join("app/Module0.php")),
        "<?php // module 0 v1.2.0\n"
    );
    let ctx = updater.context();
    let containers = recovery_containers(&ctx);
    assert_eq!(containers.len(), 1);
    let record = VersionStore::for_layout(ctx.layout())
        .load()
        .expect("must load record");
    assert_eq!(record.version, "1.2.0");
    assert_eq!(
        record.recovery_path.as_deref(),
        Some(containers[0].display().to_string().as_str())
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn local_artifact_already_in_download_dir_is_used_in_place() {
    let dir = test_dir();
    let root = seed_app(&dir);
    let updater = Updater::new(&root, quiet_config())
        .expect("must build updater")
        .with_runner(FakeRunner::default());
    let ctx = updater.context();
    let built = release_1_2_0(&dir);
    let staged = ctx.layout().download_path("update-1.2.0.zip");
    fs::create_dir_all(ctx.layout().download_dir()).expect("must create download dir");
    fs::copy(&built, &staged).expect("must stage artifact");
    let download_dir_name = ctx
        .layout()
        .download_dir()
        .file_name()
        .expect("download dir must have a name")
        .to_owned();
    let roundabout = ctx
        .layout()
        .download_dir()
        .join("..")
        .join(&download_dir_name)
        .join("update-1.2.0.zip");

    let report = updater
        .update(local_request(&roundabout), &mut no_progress())
        .expect("transaction must start");

    assert_eq!(report.outcome, TransactionOutcome::Completed, "{report:?}");
    for index in 0..10 {
        assert_eq!(
            read_file(&root.join(format!("app/Module{index}.php"))),
            format!("<?php // module {index} v1.2.0\n")
        );
    }
    assert_eq!(report.version.as_deref(), Some("1.2.0"));

    let _ = fs::remove_dir_all(&dir);
}
