use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde_json::{Map, Number, Value};
use uplift_core::DatabaseConfig;

/// One table row keyed by column name, in column order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn is_blob(&self) -> bool {
        self.declared_type.to_ascii_uppercase().contains("BLOB")
    }
}

/// Schema and row access needed to dump and reload an application database.
pub trait Database {
    fn driver(&self) -> &str;
    fn table_names(&self) -> Result<Vec<String>>;
    fn table_ddl(&self, table: &str) -> Result<String>;
    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>>;
    fn rows(&self, table: &str) -> Result<Vec<Row>>;
    fn set_foreign_keys(&self, enabled: bool) -> Result<()>;
    fn drop_table(&self, table: &str) -> Result<()>;
    fn execute_ddl(&self, ddl: &str) -> Result<()>;
    /// Inserts one batch of rows inside a single transaction.
    fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<()>;
}

pub struct SqliteDatabase {
    path: Option<PathBuf>,
    conn: Connection,
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteDatabase {
    /// Opens an existing database file. A missing file is an error rather than
    /// an empty database.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("sqlite database not found: {}", path.display()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed opening sqlite database: {}", path.display()))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn,
        })
    }

    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed creating sqlite database: {}", path.display()))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed opening in-memory sqlite")?;
        Ok(Self { path: None, conn })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Opens the database described by `config`, resolved against the
/// application root. No configured path means no database to snapshot.
pub fn open_configured(config: &DatabaseConfig, root: &Path) -> Result<Option<SqliteDatabase>> {
    let Some(path) = config.path.as_deref() else {
        return Ok(None);
    };
    if !config.driver.eq_ignore_ascii_case("sqlite") {
        return Err(anyhow!("unsupported database driver: {}", config.driver));
    }
    let path = Path::new(path);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    SqliteDatabase::open(&resolved).map(Some)
}

impl Database for SqliteDatabase {
    fn driver(&self) -> &str {
        "sqlite"
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .context("failed listing sqlite tables")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed reading sqlite table names")?;
        Ok(names)
    }

    fn table_ddl(&self, table: &str) -> Result<String> {
        self.conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get::<_, String>(0),
            )
            .with_context(|| format!("failed reading schema for table '{table}'"))
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .with_context(|| format!("failed reading columns for table '{table}'"))?;
        let columns = stmt
            .query_map([], |row| {
                let not_null: i64 = row.get(3)?;
                let primary_key: i64 = row.get(5)?;
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    declared_type: row.get(2)?,
                    nullable: not_null == 0 && primary_key == 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed reading columns for table '{table}'"))?;
        Ok(columns)
    }

    fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(table)))
            .with_context(|| format!("failed selecting rows from '{table}'"))?;
        let names = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .with_context(|| format!("failed reading row from '{table}'"))?
        {
            let mut record = Row::new();
            for (index, name) in names.iter().enumerate() {
                record.insert(name.clone(), json_from_sql(row.get_ref(index)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
        let pragma = if enabled {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        };
        self.conn
            .execute_batch(pragma)
            .context("failed toggling sqlite foreign keys")
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .with_context(|| format!("failed dropping table '{table}'"))
    }

    fn execute_ddl(&self, ddl: &str) -> Result<()> {
        self.conn
            .execute_batch(ddl)
            .with_context(|| format!("failed executing schema statement: {ddl}"))
    }

    fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let blob_columns = self
            .columns(table)?
            .into_iter()
            .filter(ColumnInfo::is_blob)
            .map(|column| column.name)
            .collect::<Vec<_>>();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed starting insert transaction")?;
        for row in rows {
            let columns = row.keys().map(|name| quote_ident(name)).collect::<Vec<_>>();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                quote_ident(table),
                columns.join(", ")
            );
            let values = row
                .iter()
                .map(|(name, value)| sql_from_json(value, blob_columns.contains(name)))
                .collect::<Vec<_>>();
            let mut stmt = tx
                .prepare_cached(&sql)
                .with_context(|| format!("failed preparing insert into '{table}'"))?;
            stmt.execute(params_from_iter(values))
                .with_context(|| format!("failed inserting row into '{table}'"))?;
        }
        tx.commit()
            .with_context(|| format!("failed committing rows into '{table}'"))
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::Number(number.into()),
        ValueRef::Real(number) => Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn sql_from_json(value: &Value, blob_column: bool) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) if blob_column => match hex::decode(text) {
            Ok(bytes) => SqlValue::Blob(bytes),
            Err(_) => SqlValue::Text(text.clone()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}
