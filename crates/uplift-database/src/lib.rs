mod dump;
mod sqlite;

pub use dump::{
    detect_format, portable_type_for, BackupSummary, DatabaseSnapshotter, RestoreSummary,
    DATABASE_BACKUP_PREFIX,
};
pub use sqlite::{open_configured, ColumnInfo, Database, Row, SqliteDatabase};
