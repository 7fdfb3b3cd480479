//! SQLite implementation of [`SecretStore`].
//!
//! Table and column names are caller-supplied, so they are always quoted.
//! Selection runs a cheap shape pre-filter in SQL and the exact envelope
//! predicate in Rust on the rows that survive it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use tracing::{debug, warn};

use crate::error::Result;

use super::traits::{ColumnRef, IdWindow, SecretStore, StaleFilter, StoredRow};

/// Rows per bulk upsert statement. Two parameters per row keeps each
/// statement far below SQLite's bound-parameter limit.
const UPSERT_CHUNK_ROWS: usize = 500;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Direct access to the connection, for schema setup and ad-hoc reads.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn query_rows(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<StoredRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok(StoredRow {
                    id: row.get(0)?,
                    value: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn select_stale_where(
        &self,
        col: &ColumnRef,
        filter: &StaleFilter,
        window: Option<IdWindow>,
    ) -> Result<Vec<StoredRow>> {
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT {id}, {value} FROM {table} WHERE {clause}",
            id = quote_ident(&col.identifier),
            value = quote_ident(&col.column),
            table = quote_ident(&col.table),
            clause = stale_clause(&quote_ident(&col.column), filter, &mut params),
        );
        if let Some(w) = window {
            push_window_clause(&mut sql, &col.identifier, w, &mut params);
        }
        sql.push_str(&format!(" ORDER BY {}", quote_ident(&col.identifier)));

        let rows = self.query_rows(&sql, params)?;
        Ok(rows
            .into_iter()
            .filter(|r| r.value.as_deref().is_some_and(|v| filter.matches(v)))
            .collect())
    }

    fn select_all_where(
        &self,
        col: &ColumnRef,
        window: Option<IdWindow>,
    ) -> Result<Vec<StoredRow>> {
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT {id}, {value} FROM {table} WHERE 1 = 1",
            id = quote_ident(&col.identifier),
            value = quote_ident(&col.column),
            table = quote_ident(&col.table),
        );
        if let Some(w) = window {
            push_window_clause(&mut sql, &col.identifier, w, &mut params);
        }
        sql.push_str(&format!(" ORDER BY {}", quote_ident(&col.identifier)));
        self.query_rows(&sql, params)
    }
}

/// Double-quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn stale_clause(column: &str, filter: &StaleFilter, params: &mut Vec<SqlValue>) -> String {
    let mut clause = format!("{column} GLOB '[0-9]*:[0-9]*:?*' AND {column} NOT LIKE ?");
    params.push(SqlValue::Text(format!("{}:%", filter.latest_version)));
    for prefix in &filter.exclude_prefixes {
        clause.push_str(&format!(" AND substr({column}, 1, ?) <> ?"));
        params.push(SqlValue::Integer(prefix.chars().count() as i64));
        params.push(SqlValue::Text(prefix.clone()));
    }
    clause
}

fn push_window_clause(sql: &mut String, identifier: &str, w: IdWindow, params: &mut Vec<SqlValue>) {
    sql.push_str(&format!(" AND {} BETWEEN ? AND ?", quote_ident(identifier)));
    params.push(SqlValue::Integer(w.start));
    params.push(SqlValue::Integer(w.end));
}

impl SecretStore for SqliteStore {
    fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn select_stale(&self, col: &ColumnRef, filter: &StaleFilter) -> Result<Vec<StoredRow>> {
        self.select_stale_where(col, filter, None)
    }

    fn id_bounds(&self, col: &ColumnRef) -> Result<Option<(i64, i64)>> {
        let sql = format!(
            "SELECT MIN({id}), MAX({id}) FROM {table}",
            id = quote_ident(&col.identifier),
            table = quote_ident(&col.table),
        );
        let bounds: (Option<i64>, Option<i64>) =
            self.conn
                .lock()
                .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(match bounds {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }

    fn select_stale_in_window(
        &self,
        col: &ColumnRef,
        filter: &StaleFilter,
        window: IdWindow,
    ) -> Result<Vec<StoredRow>> {
        self.select_stale_where(col, filter, Some(window))
    }

    fn select_all(&self, col: &ColumnRef) -> Result<Vec<StoredRow>> {
        self.select_all_where(col, None)
    }

    fn select_all_in_window(&self, col: &ColumnRef, window: IdWindow) -> Result<Vec<StoredRow>> {
        self.select_all_where(col, Some(window))
    }

    fn begin(&self) -> Result<()> {
        self.conn.lock().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn update_value(&self, col: &ColumnRef, id: i64, value: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET {value} = ?1 WHERE {id} = ?2",
            table = quote_ident(&col.table),
            value = quote_ident(&col.column),
            id = quote_ident(&col.identifier),
        );
        let changed = self.conn.lock().execute(&sql, params![value, id])?;
        if changed == 0 {
            warn!(table = %col.table, id, "row disappeared before update");
        }
        Ok(())
    }

    fn upsert_values(&self, col: &ColumnRef, rows: &[(i64, String)]) -> Result<()> {
        let table = quote_ident(&col.table);
        let id = quote_ident(&col.identifier);
        let value = quote_ident(&col.column);
        let conn = self.conn.lock();

        for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
            let placeholders = vec!["(?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO {table} ({id}, {value}) VALUES {placeholders} \
                 ON CONFLICT({id}) DO UPDATE SET {value} = excluded.{value}"
            );
            let params = chunk.iter().flat_map(|(row_id, v)| {
                [SqlValue::Integer(*row_id), SqlValue::Text(v.clone())]
            });
            conn.execute(&sql, params_from_iter(params))?;
        }
        debug!(table = %col.table, rows = rows.len(), "bulk upsert");
        Ok(())
    }
}
