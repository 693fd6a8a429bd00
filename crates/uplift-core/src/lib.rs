mod config;
mod context;
mod error;
mod exclusion;
mod layout;
mod manifest;
mod version;

pub use config::{
    AllowedOperators, CheckMethod, DatabaseConfig, DependencyConfig, DumpFormat, LicenseConfig,
    MaintenanceConfig, UpdaterConfig, CONFIG_FILE_NAME, DEFAULT_EXCLUDED_PATHS,
};
pub use context::{current_timestamp, file_stamp, LogEntry, OperationContext, Severity};
pub use error::{AbortStage, FetchError, UpdateError};
pub use exclusion::{is_suspicious_path, normalize_rel_path, relative_to, ExclusionSet};
pub use layout::{
    AppLayout, MAINTENANCE_MARKER_FILE_NAME, RECOVERY_CONTAINER_PREFIX, VERSION_RECORD_FILE_NAME,
};
pub use manifest::{UpdateManifest, MANIFEST_FILE_NAME};
pub use version::{is_newer_version, parse_lenient_version, VersionRecord, DEFAULT_VERSION};
