//! In-memory [`SecretStore`] with a transaction buffer.
//!
//! Used by tests and for verifying that a dry run leaves a store untouched:
//! every committed write bumps [`MemoryStore::write_count`].

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{RekeyError, Result};

use super::traits::{ColumnRef, IdWindow, SecretStore, StaleFilter, StoredRow};

/// id → column → value
type TableRows = BTreeMap<i64, HashMap<String, Option<String>>>;

/// (table, id, column) → value written inside the open transaction
type TxBuffer = HashMap<(String, i64, String), String>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, TableRows>>,
    tx: Mutex<Option<TxBuffer>>,
    writes: Mutex<usize>,
    /// Fail every write once this many have been accepted.
    fail_after: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, table: &str) {
        self.tables.lock().entry(table.to_string()).or_default();
    }

    /// Seed a value directly, outside any transaction and the write counter.
    pub fn insert(&self, table: &str, id: i64, column: &str, value: Option<&str>) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .entry(id)
            .or_default()
            .insert(column.to_string(), value.map(str::to_string));
    }

    /// Committed value of a cell.
    pub fn value(&self, table: &str, id: i64, column: &str) -> Option<String> {
        self.tables
            .lock()
            .get(table)
            .and_then(|rows| rows.get(&id))
            .and_then(|row| row.get(column).cloned().flatten())
    }

    /// Committed contents of a table column, in id order.
    pub fn snapshot(&self, table: &str, column: &str) -> Vec<StoredRow> {
        self.tables
            .lock()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, row)| StoredRow {
                        id: *id,
                        value: row.get(column).cloned().flatten(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of committed cell writes.
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }

    pub fn fail_writes_after(&self, accepted: usize) {
        *self.fail_after.lock() = Some(accepted);
    }

    fn rows(&self, col: &ColumnRef, window: Option<IdWindow>) -> Result<Vec<StoredRow>> {
        let tables = self.tables.lock();
        let rows = tables.get(&col.table).ok_or_else(|| {
            RekeyError::StorageUnavailable(format!("no such table: {}", col.table))
        })?;
        let tx = self.tx.lock();
        Ok(rows
            .iter()
            .filter(|(id, _)| window.map_or(true, |w| w.contains(**id)))
            .map(|(id, row)| {
                let buffered = tx
                    .as_ref()
                    .and_then(|buf| buf.get(&(col.table.clone(), *id, col.column.clone())));
                StoredRow {
                    id: *id,
                    value: match buffered {
                        Some(v) => Some(v.clone()),
                        None => row.get(&col.column).cloned().flatten(),
                    },
                }
            })
            .collect())
    }

    fn write(&self, col: &ColumnRef, id: i64, value: &str) -> Result<()> {
        let mut fail_after = self.fail_after.lock();
        if let Some(remaining) = fail_after.as_mut() {
            if *remaining == 0 {
                return Err(RekeyError::WriteConflict(format!(
                    "write to {}.{} id {id} rejected",
                    col.table, col.column
                )));
            }
            *remaining -= 1;
        }
        drop(fail_after);

        let mut tx = self.tx.lock();
        if let Some(buf) = tx.as_mut() {
            buf.insert((col.table.clone(), id, col.column.clone()), value.to_string());
        } else {
            drop(tx);
            self.insert(&col.table, id, &col.column, Some(value));
            *self.writes.lock() += 1;
        }
        Ok(())
    }
}

impl SecretStore for MemoryStore {
    fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.lock().contains_key(table))
    }

    fn select_stale(&self, col: &ColumnRef, filter: &StaleFilter) -> Result<Vec<StoredRow>> {
        Ok(self
            .rows(col, None)?
            .into_iter()
            .filter(|r| r.value.as_deref().is_some_and(|v| filter.matches(v)))
            .collect())
    }

    fn id_bounds(&self, col: &ColumnRef) -> Result<Option<(i64, i64)>> {
        let tables = self.tables.lock();
        let rows = tables.get(&col.table).ok_or_else(|| {
            RekeyError::StorageUnavailable(format!("no such table: {}", col.table))
        })?;
        Ok(rows
            .keys()
            .next()
            .zip(rows.keys().next_back())
            .map(|(min, max)| (*min, *max)))
    }

    fn select_stale_in_window(
        &self,
        col: &ColumnRef,
        filter: &StaleFilter,
        window: IdWindow,
    ) -> Result<Vec<StoredRow>> {
        Ok(self
            .rows(col, Some(window))?
            .into_iter()
            .filter(|r| r.value.as_deref().is_some_and(|v| filter.matches(v)))
            .collect())
    }

    fn select_all(&self, col: &ColumnRef) -> Result<Vec<StoredRow>> {
        self.rows(col, None)
    }

    fn select_all_in_window(&self, col: &ColumnRef, window: IdWindow) -> Result<Vec<StoredRow>> {
        self.rows(col, Some(window))
    }

    fn begin(&self) -> Result<()> {
        let mut tx = self.tx.lock();
        if tx.is_some() {
            return Err(RekeyError::WriteConflict(
                "nested transactions are not supported".into(),
            ));
        }
        *tx = Some(HashMap::new());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let buf = self
            .tx
            .lock()
            .take()
            .ok_or_else(|| RekeyError::WriteConflict("commit without transaction".into()))?;
        let written = buf.len();
        for ((table, id, column), value) in buf {
            self.insert(&table, id, &column, Some(&value));
        }
        *self.writes.lock() += written;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        *self.tx.lock() = None;
        Ok(())
    }

    fn update_value(&self, col: &ColumnRef, id: i64, value: &str) -> Result<()> {
        let exists = self
            .tables
            .lock()
            .get(&col.table)
            .is_some_and(|rows| rows.contains_key(&id));
        if !exists {
            warn!(table = %col.table, id, "row disappeared before update");
            return Ok(());
        }
        self.write(col, id, value)
    }

    fn upsert_values(&self, col: &ColumnRef, rows: &[(i64, String)]) -> Result<()> {
        rows.iter().try_for_each(|(id, value)| self.write(col, *id, value))
    }
}
