use crate::error::{Error, Result};
use crate::types::{Row, RowKey};
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;

/// How a batch should be written.
#[derive(Debug, Clone, Default)]
pub struct InsertOptions<'a> {
    /// Add columns that the table does not have yet.
    pub alter: bool,
    /// Columns to put first when the table is created.
    pub column_order: &'a [&'a str],
    /// `(column, other_table)`: column references `other_table`'s primary key.
    pub foreign_keys: &'a [(&'a str, &'a str)],
    /// Name of a TEXT primary key filled with a hash of the row's content.
    pub hash_id: Option<&'a str>,
    /// Rows per transaction; 0 means everything in one.
    pub batch_size: usize,
}

/// Schema-on-write row sink.
pub trait Store {
    /// Write `rows`, creating or extending `table` as needed. Returns the key of
    /// the last row written, or `None` if `rows` was empty.
    fn insert_all(
        &mut self,
        table: &str,
        rows: &[Row],
        opts: &InsertOptions<'_>,
    ) -> Result<Option<RowKey>>;

    fn insert(&mut self, table: &str, row: &Row, opts: &InsertOptions<'_>) -> Result<RowKey> {
        self.insert_all(table, std::slice::from_ref(row), opts)?
            .ok_or_else(|| Error::Schema {
                table: table.to_string(),
                reason: "insert produced no row".to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Text,
    Integer,
    Float,
}

impl ColumnType {
    fn of(v: &JsonValue) -> Option<Self> {
        match v {
            JsonValue::Null => None,
            JsonValue::Bool(_) => Some(Self::Integer),
            JsonValue::Number(n) if n.is_i64() || n.is_u64() => Some(Self::Integer),
            JsonValue::Number(_) => Some(Self::Float),
            JsonValue::String(_) | JsonValue::Array(_) | JsonValue::Object(_) => Some(Self::Text),
        }
    }

    const fn sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
        }
    }
}

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn })
    }

    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Column names of `table`, empty if it does not exist.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cols)
    }

    fn primary_key(&self, table: &str) -> Result<String> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let mut rows = stmt.query([])?;
        let mut seen = false;
        while let Some(row) = rows.next()? {
            seen = true;
            let pk: i64 = row.get(5)?;
            if pk > 0 {
                return Ok(row.get(1)?);
            }
        }
        if !seen {
            return Err(Error::Schema {
                table: table.to_string(),
                reason: "referenced table does not exist".to_string(),
            });
        }
        Ok("rowid".to_string())
    }

    fn create_table(
        &self,
        table: &str,
        columns: &[(String, Option<ColumnType>)],
        opts: &InsertOptions<'_>,
    ) -> Result<()> {
        let mut defs: Vec<String> = Vec::with_capacity(columns.len() + 1);
        if let Some(id) = opts.hash_id {
            defs.push(format!("{} TEXT PRIMARY KEY", quote_ident(id)));
        }
        for (name, ty) in columns {
            let ty = ty.unwrap_or(ColumnType::Text);
            defs.push(format!("{} {}", quote_ident(name), ty.sql()));
        }
        for (column, other) in opts.foreign_keys {
            let other_pk = self.primary_key(other)?;
            defs.push(format!(
                "FOREIGN KEY({}) REFERENCES {}({})",
                quote_ident(column),
                quote_ident(other),
                quote_ident(&other_pk)
            ));
        }

        let sql = format!("CREATE TABLE {} (\n  {}\n)", quote_ident(table), defs.join(",\n  "));
        tracing::debug!(table, columns = columns.len(), "creating table");
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    fn ensure_table(
        &self,
        table: &str,
        columns: &[(String, Option<ColumnType>)],
        opts: &InsertOptions<'_>,
    ) -> Result<()> {
        let existing = self.table_columns(table)?;
        if existing.is_empty() {
            return self.create_table(table, columns, opts);
        }

        for (name, ty) in columns {
            if existing.iter().any(|c| c == name) {
                continue;
            }
            if !opts.alter {
                return Err(Error::Schema {
                    table: table.to_string(),
                    reason: format!("no such column: {name}"),
                });
            }
            let ty = ty.unwrap_or(ColumnType::Text);
            tracing::debug!(table, column = %name, "adding column");
            self.conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table),
                quote_ident(name),
                ty.sql()
            ))?;
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn insert_all(
        &mut self,
        table: &str,
        rows: &[Row],
        opts: &InsertOptions<'_>,
    ) -> Result<Option<RowKey>> {
        if rows.is_empty() {
            return Ok(None);
        }

        let columns = plan_columns(rows, opts.column_order);
        self.ensure_table(table, &columns, opts)?;

        let mut names: Vec<String> = Vec::with_capacity(columns.len() + 1);
        if let Some(id) = opts.hash_id {
            names.push(quote_ident(id));
        }
        names.extend(columns.iter().map(|(c, _)| quote_ident(c)));
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.join(", "),
            placeholders.join(", ")
        );

        let chunk = if opts.batch_size == 0 {
            rows.len()
        } else {
            opts.batch_size
        };

        let mut last = None;
        for batch in rows.chunks(chunk) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for row in batch {
                    let mut values: Vec<SqlValue> = Vec::with_capacity(names.len());
                    let hash = match opts.hash_id {
                        Some(_) => {
                            let h = hash_row(row)?;
                            values.push(SqlValue::Text(h.clone()));
                            Some(h)
                        }
                        None => None,
                    };
                    values.extend(columns.iter().map(|(c, _)| to_sql(row.get(c))));
                    stmt.execute(rusqlite::params_from_iter(values))?;
                    last = Some(hash.map_or_else(
                        || RowKey::Rowid(tx.last_insert_rowid()),
                        RowKey::Hash,
                    ));
                }
            }
            tx.commit()?;
        }

        Ok(last)
    }
}

/// Columns in write order with the first non-null type seen for each.
fn plan_columns(rows: &[Row], column_order: &[&str]) -> Vec<(String, Option<ColumnType>)> {
    let mut seen: Vec<(String, Option<ColumnType>)> = Vec::new();
    for row in rows {
        for (k, v) in row {
            match seen.iter_mut().find(|(name, _)| name == k) {
                Some((_, ty)) => {
                    if ty.is_none() {
                        *ty = ColumnType::of(v);
                    }
                }
                None => seen.push((k.clone(), ColumnType::of(v))),
            }
        }
    }

    let mut ordered = Vec::with_capacity(seen.len());
    for wanted in column_order {
        if let Some(pos) = seen.iter().position(|(name, _)| name.as_str() == *wanted) {
            ordered.push(seen.remove(pos));
        }
    }
    ordered.extend(seen);
    ordered
}

fn to_sql(v: Option<&JsonValue>) -> SqlValue {
    match v {
        None | Some(JsonValue::Null) => SqlValue::Null,
        Some(JsonValue::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(JsonValue::Number(n)) => n.as_i64().map_or_else(
            || SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            SqlValue::Integer,
        ),
        Some(JsonValue::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

/// SHA-256 (hex) of the row as compact JSON with sorted keys.
pub fn hash_row(row: &Row) -> Result<String> {
    let bytes = serde_json::to_vec(row)?;
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    Ok(out)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
