use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "uplift.toml";

pub const DEFAULT_EXCLUDED_PATHS: [&str; 3] = [".env", "storage", "bootstrap/cache"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub update_base_url: String,
    pub tmp_directory: String,
    pub state_directory: String,
    pub script_filename: String,
    pub hook_interpreter: Vec<String>,
    pub request_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub online_check: bool,
    pub check_method: CheckMethod,
    pub excluded_paths: Vec<String>,
    pub post_update_commands: Vec<String>,
    pub cache_clear_commands: Vec<String>,
    pub allowed_operators: AllowedOperators,
    pub dependencies: DependencyConfig,
    pub database: DatabaseConfig,
    pub maintenance: MaintenanceConfig,
    pub license: Option<LicenseConfig>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            update_base_url: "http://localhost/updates".to_string(),
            tmp_directory: "updater_tmp".to_string(),
            state_directory: "storage/app/updater".to_string(),
            script_filename: "upgrade.sh".to_string(),
            hook_interpreter: vec!["sh".to_string()],
            request_timeout_secs: 60,
            command_timeout_secs: 600,
            online_check: true,
            check_method: CheckMethod::Post,
            excluded_paths: DEFAULT_EXCLUDED_PATHS
                .iter()
                .map(|path| path.to_string())
                .collect(),
            post_update_commands: [
                "php artisan cache:clear",
                "php artisan config:cache",
                "php artisan view:cache",
                "php artisan route:cache",
                "php artisan migrate --force",
            ]
            .iter()
            .map(|command| command.to_string())
            .collect(),
            cache_clear_commands: [
                "php artisan cache:clear",
                "php artisan config:clear",
                "php artisan view:clear",
                "php artisan route:clear",
            ]
            .iter()
            .map(|command| command.to_string())
            .collect(),
            allowed_operators: AllowedOperators::default(),
            dependencies: DependencyConfig::default(),
            database: DatabaseConfig::default(),
            maintenance: MaintenanceConfig::default(),
            license: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMethod {
    Get,
    Post,
}

/// Either a list of operator identities or a flag. `false` disables the
/// permission check entirely; `true` without a list admits nobody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowedOperators {
    Flag(bool),
    List(Vec<String>),
}

impl Default for AllowedOperators {
    fn default() -> Self {
        Self::List(vec!["1".to_string()])
    }
}

impl AllowedOperators {
    pub fn permits(&self, operator: Option<&str>) -> bool {
        match self {
            Self::Flag(enabled) => !enabled,
            Self::List(allowed) => operator
                .map(str::trim)
                .is_some_and(|operator| allowed.iter().any(|entry| entry.trim() == operator)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    pub directory: String,
    pub descriptors: Vec<String>,
    pub rebuild_command: Vec<String>,
    pub rebuild_timeout_secs: u64,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            directory: "vendor".to_string(),
            descriptors: vec!["composer.json".to_string(), "composer.lock".to_string()],
            rebuild_command: ["composer", "install", "--no-dev", "--optimize-autoloader"]
                .iter()
                .map(|arg| arg.to_string())
                .collect(),
            rebuild_timeout_secs: 3600,
        }
    }
}

impl DependencyConfig {
    pub fn rebuild_timeout(&self) -> Duration {
        Duration::from_secs(self.rebuild_timeout_secs)
    }
}

/// `Basic` keeps each table's DDL verbatim. `Portable` describes columns by
/// engine-neutral types for restoring into a different engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    Basic,
    Portable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: String,
    pub path: Option<String>,
    pub dump_format: DumpFormat,
    pub batch_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            path: None,
            dump_format: DumpFormat::Basic,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enter_command: Option<String>,
    pub exit_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseConfig {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

impl UpdaterConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse updater config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading updater config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed loading updater config: {}", path.display()))
    }

    pub fn load_from_root(root: &Path) -> Result<Self> {
        Self::load(&root.join(CONFIG_FILE_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than zero"));
        }
        if self.hook_interpreter.is_empty() {
            return Err(anyhow!("hook_interpreter must name a program"));
        }
        if self.script_filename.trim().is_empty()
            || self.script_filename.contains(['/', '\\'])
        {
            return Err(anyhow!(
                "script_filename must be a bare file name: {}",
                self.script_filename
            ));
        }
        for (field, value) in [
            ("tmp_directory", &self.tmp_directory),
            ("state_directory", &self.state_directory),
            ("dependencies.directory", &self.dependencies.directory),
        ] {
            validate_relative_dir(field, value)?;
        }
        if self.database.batch_size == 0 {
            return Err(anyhow!("database.batch_size must be greater than zero"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn validate_relative_dir(field: &str, value: &str) -> Result<()> {
    let normalized = value.replace('\\', "/");
    let trimmed = normalized.trim_matches('/');
    if trimmed.is_empty() {
        return Err(anyhow!("{field} must not be empty"));
    }
    if normalized.starts_with('/') || trimmed.split('/').any(|segment| segment == "..") {
        return Err(anyhow!(
            "{field} must be relative to the application root: {value}"
        ));
    }
    Ok(())
}
