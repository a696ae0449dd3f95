//! Access to the host's content tables.
//!
//! The engine never assumes a particular schema beyond "every table has an
//! integer `id` primary key". Everything else (which tables, which fields,
//! which foreign keys lead to a scope) comes from the registry.

use anyhow::{bail, Context, Result};
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::debug;

/// SQLite caps bound parameters; id lists are split into chunks of this size.
const ID_CHUNK: usize = 500;

/// A row read from a content table: its id plus the requested columns.
///
/// Every value is kept as text; integer columns are parsed on demand.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentRow {
    pub id: i64,
    pub values: HashMap<String, Option<String>>,
}

impl ContentRow {
    pub fn text(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.text(column).and_then(|v| v.trim().parse().ok())
    }
}

/// Generic relational access to host content.
pub trait ContentStore: Send + Sync {
    /// Rows with `id > after_id`, ascending, at most `limit`.
    fn read_page(
        &self,
        table: &str,
        columns: &[String],
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ContentRow>>;

    /// Rows by primary key, ascending. Missing ids are simply absent.
    fn read_rows(&self, table: &str, columns: &[String], ids: &[i64]) -> Result<Vec<ContentRow>>;

    /// Ids of rows whose `column` holds one of `values`.
    fn ids_where(&self, table: &str, column: &str, values: &[i64]) -> Result<Vec<i64>>;

    /// The subset of `ids` that exist in `table`.
    fn existing_ids(&self, table: &str, ids: &[i64]) -> Result<HashSet<i64>>;

    /// Write text fields of one row.
    fn update_fields(&self, table: &str, id: i64, changes: &[(String, String)]) -> Result<()>;
}

static IDENT_RE: OnceLock<Regex> = OnceLock::new();

/// Quote a table/column name after checking it is a plain identifier.
pub fn quote_ident(name: &str) -> Result<String> {
    let re = IDENT_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is a valid regex")
    });
    if !re.is_match(name) {
        bail!("Invalid table or column name: {:?}", name);
    }
    Ok(format!("\"{}\"", name))
}

/// Content store over a SQLite database.
#[derive(Clone)]
pub struct SqliteContentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteContentStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .context(format!("Failed to open content database at {}", path))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory content database")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run raw SQL against the content database (schema setup, fixtures).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("content store connection mutex poisoned"))
    }

    fn select_list(columns: &[String]) -> Result<String> {
        let mut list = vec!["\"id\"".to_string()];
        for column in columns {
            if column != "id" {
                list.push(quote_ident(column)?);
            }
        }
        Ok(list.join(", "))
    }

    fn query_rows(
        conn: &Connection,
        sql: &str,
        columns: &[String],
        params: &[i64],
    ) -> Result<Vec<ContentRow>> {
        let mut stmt = conn.prepare(sql)?;
        let wanted: Vec<&String> = columns.iter().filter(|c| c.as_str() != "id").collect();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let mut values = HashMap::with_capacity(wanted.len());
                for (i, column) in wanted.iter().enumerate() {
                    values.insert((*column).clone(), value_to_text(row.get_ref(i + 1)?));
                }
                Ok(ContentRow {
                    id: row.get(0)?,
                    values,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

impl ContentStore for SqliteContentStore {
    fn read_page(
        &self,
        table: &str,
        columns: &[String],
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ContentRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE \"id\" > ? ORDER BY \"id\" LIMIT {}",
            Self::select_list(columns)?,
            quote_ident(table)?,
            limit
        );
        let conn = self.lock()?;
        Self::query_rows(&conn, &sql, columns, &[after_id])
            .with_context(|| format!("Failed to read page of {} after id {}", table, after_id))
    }

    fn read_rows(&self, table: &str, columns: &[String], ids: &[i64]) -> Result<Vec<ContentRow>> {
        let select = Self::select_list(columns)?;
        let table_ident = quote_ident(table)?;
        let conn = self.lock()?;

        let mut rows = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {} FROM {} WHERE \"id\" IN ({}) ORDER BY \"id\"",
                select,
                table_ident,
                crate::db::placeholders(chunk.len())
            );
            rows.extend(
                Self::query_rows(&conn, &sql, columns, chunk)
                    .with_context(|| format!("Failed to read rows of {}", table))?,
            );
        }
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    fn ids_where(&self, table: &str, column: &str, values: &[i64]) -> Result<Vec<i64>> {
        let table_ident = quote_ident(table)?;
        let column_ident = quote_ident(column)?;
        let conn = self.lock()?;

        let mut ids = Vec::new();
        for chunk in values.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT \"id\" FROM {} WHERE {} IN ({}) ORDER BY \"id\"",
                table_ident,
                column_ident,
                crate::db::placeholders(chunk.len())
            );
            let mut stmt = conn
                .prepare(&sql)
                .with_context(|| format!("Failed to query {}.{}", table, column))?;
            let found = stmt
                .query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.extend(found);
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn existing_ids(&self, table: &str, ids: &[i64]) -> Result<HashSet<i64>> {
        let rows = self.read_rows(table, &[], ids)?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    fn update_fields(&self, table: &str, id: i64, changes: &[(String, String)]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let assignments = changes
            .iter()
            .enumerate()
            .map(|(i, (column, _))| -> Result<String> {
                Ok(format!("{} = ?{}", quote_ident(column)?, i + 1))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE \"id\" = ?{}",
            quote_ident(table)?,
            assignments,
            changes.len() + 1
        );

        let mut values: Vec<rusqlite::types::Value> = changes
            .iter()
            .map(|(_, text)| rusqlite::types::Value::Text(text.clone()))
            .collect();
        values.push(rusqlite::types::Value::Integer(id));

        let conn = self.lock()?;
        let updated = conn
            .execute(&sql, params_from_iter(values.iter()))
            .with_context(|| format!("Failed to update {} id {}", table, id))?;
        debug!("Updated {} field(s) of {} id {} ({} row)", changes.len(), table, id, updated);
        Ok(())
    }
}
