use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uplift_core::{current_timestamp, file_stamp, DatabaseConfig, DumpFormat};

use crate::sqlite::{quote_ident, Database, Row};

pub const DATABASE_BACKUP_PREFIX: &str = "database_backup_";
const PORTABLE_DUMP_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub path: PathBuf,
    pub tables: usize,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub format: DumpFormat,
    pub tables: usize,
    pub records: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BasicTable {
    structure: String,
    #[serde(default)]
    data: Vec<Row>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PortableMetadata {
    driver: String,
    created_at: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PortableTable {
    /// Source DDL, replayed when the dump is restored into the same engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    structure: Option<String>,
    columns: Map<String, Value>,
    #[serde(default)]
    records: Vec<Row>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PortableColumn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    nullable: bool,
}

/// Dumps a database to one JSON file and loads such a file back, dropping and
/// recreating every table it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseSnapshotter {
    format: DumpFormat,
    batch_size: usize,
}

impl Default for DatabaseSnapshotter {
    fn default() -> Self {
        Self::from_config(&DatabaseConfig::default())
    }
}

impl DatabaseSnapshotter {
    pub fn new(format: DumpFormat, batch_size: usize) -> Self {
        Self {
            format,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.dump_format, config.batch_size)
    }

    pub fn format(&self) -> DumpFormat {
        self.format
    }

    pub fn backup(&self, db: &dyn Database, dir: &Path) -> Result<BackupSummary> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed creating backup dir: {}", dir.display()))?;
        let path = dir.join(format!("{DATABASE_BACKUP_PREFIX}{}.json", file_stamp()));

        let mut tables = Map::new();
        let mut records = 0;
        for table in db.table_names()? {
            let rows = db.rows(&table)?;
            records += rows.len();
            let entry = match self.format {
                DumpFormat::Basic => serde_json::to_value(BasicTable {
                    structure: db.table_ddl(&table)?,
                    data: rows,
                })?,
                DumpFormat::Portable => {
                    let mut columns = Map::new();
                    for column in db.columns(&table)? {
                        columns.insert(
                            column.name.clone(),
                            serde_json::to_value(PortableColumn {
                                kind: portable_type_for(&column.declared_type).to_string(),
                                nullable: column.nullable,
                            })?,
                        );
                    }
                    serde_json::to_value(PortableTable {
                        structure: Some(db.table_ddl(&table)?),
                        columns,
                        records: rows,
                    })?
                }
            };
            tables.insert(table, entry);
        }
        let table_count = tables.len();

        let document = match self.format {
            DumpFormat::Basic => Value::Object(tables),
            DumpFormat::Portable => {
                let mut document = Map::new();
                document.insert(
                    "metadata".to_string(),
                    serde_json::to_value(PortableMetadata {
                        driver: db.driver().to_string(),
                        created_at: current_timestamp(),
                        version: PORTABLE_DUMP_VERSION.to_string(),
                    })?,
                );
                document.insert("tables".to_string(), Value::Object(tables));
                Value::Object(document)
            }
        };
        let encoded =
            serde_json::to_string_pretty(&document).context("failed encoding database dump")?;
        fs::write(&path, encoded)
            .with_context(|| format!("failed writing database dump: {}", path.display()))?;

        tracing::debug!(
            path = %path.display(),
            tables = table_count,
            records,
            "database dump written"
        );
        Ok(BackupSummary {
            path,
            tables: table_count,
            records,
        })
    }

    /// Foreign keys are switched off for the duration and switched back on
    /// even when a table fails to load.
    pub fn restore(&self, db: &dyn Database, path: &Path) -> Result<RestoreSummary> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading database dump: {}", path.display()))?;
        let document: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing database dump: {}", path.display()))?;
        let format = detect_format(&document)?;

        db.set_foreign_keys(false)?;
        let result = match format {
            DumpFormat::Basic => self.restore_basic(db, document),
            DumpFormat::Portable => self.restore_portable(db, document),
        };
        let reenabled = db.set_foreign_keys(true);
        let (tables, records) =
            result.with_context(|| format!("failed restoring database dump: {}", path.display()))?;
        reenabled?;

        Ok(RestoreSummary {
            format,
            tables,
            records,
        })
    }

    fn restore_basic(&self, db: &dyn Database, document: Value) -> Result<(usize, usize)> {
        let tables: Map<String, Value> = serde_json::from_value(document)?;
        let mut records = 0;
        let table_count = tables.len();
        for (name, entry) in tables {
            let table: BasicTable = serde_json::from_value(entry)
                .with_context(|| format!("malformed dump entry for table '{name}'"))?;
            db.drop_table(&name)?;
            db.execute_ddl(&table.structure)?;
            records += self.insert_batched(db, &name, &table.data)?;
        }
        Ok((table_count, records))
    }

    fn restore_portable(&self, db: &dyn Database, document: Value) -> Result<(usize, usize)> {
        let tables = match document.get("tables") {
            Some(Value::Object(tables)) => tables.clone(),
            _ => return Err(anyhow!("portable dump has no tables object")),
        };
        let same_engine = document
            .pointer("/metadata/driver")
            .and_then(Value::as_str)
            .is_some_and(|driver| driver.eq_ignore_ascii_case(db.driver()));
        let mut records = 0;
        let table_count = tables.len();
        for (name, entry) in tables {
            let table: PortableTable = serde_json::from_value(entry)
                .with_context(|| format!("malformed dump entry for table '{name}'"))?;
            let ddl = match table.structure.filter(|_| same_engine) {
                Some(structure) => structure,
                None => portable_ddl(&name, table.columns)?,
            };

            db.drop_table(&name)?;
            db.execute_ddl(&ddl)?;
            records += self.insert_batched(db, &name, &table.records)?;
        }
        Ok((table_count, records))
    }

    fn insert_batched(&self, db: &dyn Database, table: &str, rows: &[Row]) -> Result<usize> {
        for chunk in rows.chunks(self.batch_size) {
            db.insert_rows(table, chunk)?;
        }
        Ok(rows.len())
    }
}

/// `CREATE TABLE` built from portable column descriptors. Keys, defaults and
/// references are not part of the descriptors and are not recreated.
fn portable_ddl(name: &str, columns: Map<String, Value>) -> Result<String> {
    let mut definitions = Vec::with_capacity(columns.len());
    for (column, descriptor) in columns {
        let descriptor: PortableColumn = serde_json::from_value(descriptor)
            .with_context(|| format!("malformed column '{column}' in table '{name}'"))?;
        let mut definition = format!(
            "{} {}",
            quote_ident(&column),
            sqlite_type_for(&descriptor.kind)
        );
        if !descriptor.nullable {
            definition.push_str(" NOT NULL");
        }
        definitions.push(definition);
    }
    if definitions.is_empty() {
        return Err(anyhow!("portable dump table '{name}' has no columns"));
    }
    Ok(format!(
        "CREATE TABLE {} ({})",
        quote_ident(name),
        definitions.join(", ")
    ))
}

pub fn detect_format(document: &Value) -> Result<DumpFormat> {
    let Value::Object(map) = document else {
        return Err(anyhow!("database dump must be a JSON object"));
    };
    if matches!(map.get("metadata"), Some(Value::Object(_)))
        && matches!(map.get("tables"), Some(Value::Object(_)))
    {
        return Ok(DumpFormat::Portable);
    }
    let basic = map
        .values()
        .all(|entry| matches!(entry.get("structure"), Some(Value::String(_))));
    if basic {
        Ok(DumpFormat::Basic)
    } else {
        Err(anyhow!("unrecognised database dump format"))
    }
}

/// Engine-neutral name for a declared column type. Unknown types map to
/// `string`.
pub fn portable_type_for(declared: &str) -> &'static str {
    let upper = declared.trim().to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or_default().trim();
    match base {
        "INTEGER" | "INT" | "MEDIUMINT" => "integer",
        "TINYINT" | "SMALLINT" => "smallint",
        "BIGINT" | "UNSIGNED BIG INT" | "INT8" => "bigint",
        "BOOLEAN" | "BOOL" => "boolean",
        "DECIMAL" | "NUMERIC" => "decimal",
        "REAL" | "FLOAT" | "DOUBLE" | "DOUBLE PRECISION" => "float",
        "TEXT" | "CLOB" | "LONGTEXT" | "MEDIUMTEXT" => "text",
        "VARCHAR" | "CHAR" | "CHARACTER" | "NVARCHAR" | "NCHAR" | "VARYING CHARACTER" => "string",
        "DATE" => "date",
        "DATETIME" | "TIMESTAMP" => "datetime",
        "TIME" => "time",
        "JSON" => "json",
        "BLOB" => "binary",
        _ => "string",
    }
}

fn sqlite_type_for(portable: &str) -> &'static str {
    match portable {
        "integer" | "smallint" | "bigint" | "boolean" => "INTEGER",
        "float" => "REAL",
        "decimal" => "NUMERIC",
        "binary" => "BLOB",
        "text" | "json" => "TEXT",
        "date" => "DATE",
        "datetime" => "DATETIME",
        "time" => "TIME",
        _ => "VARCHAR",
    }
}
