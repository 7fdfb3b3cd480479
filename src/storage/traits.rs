//! Store seam for the batch table scanner.

use tracing::warn;

use crate::envelope::is_stale;
use crate::error::{RekeyError, Result};

// ============================================================================
// Addressing
// ============================================================================

/// A column of a table, addressed by its integer identifier column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub identifier: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(
        table: impl Into<String>,
        identifier: impl Into<String>,
        column: impl Into<String>,
    ) -> Result<Self> {
        let col = Self {
            table: table.into(),
            identifier: identifier.into(),
            column: column.into(),
        };
        if col.table.is_empty() {
            return Err(RekeyError::InvalidArgument("Provide a table name".into()));
        }
        if col.identifier.is_empty() {
            return Err(RekeyError::InvalidArgument("Provide an identifier".into()));
        }
        if col.column.is_empty() {
            return Err(RekeyError::InvalidArgument("Provide a column".into()));
        }
        Ok(col)
    }
}

/// Inclusive identifier range processed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdWindow {
    pub start: i64,
    pub end: i64,
}

impl IdWindow {
    pub fn contains(&self, id: i64) -> bool {
        id >= self.start && id <= self.end
    }

    pub fn len(&self) -> u64 {
        (self.end - self.start + 1) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Logical row predicate: ciphertext-shaped, not under `latest_version`, and
/// not starting with any of the excluded prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleFilter {
    pub latest_version: u32,
    pub exclude_prefixes: Vec<String>,
}

impl StaleFilter {
    pub fn new(latest_version: u32) -> Self {
        Self {
            latest_version,
            exclude_prefixes: Vec::new(),
        }
    }

    pub fn excluding<I, P>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.exclude_prefixes
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    pub fn matches(&self, value: &str) -> bool {
        is_stale(value, self.latest_version)
            && !self
                .exclude_prefixes
                .iter()
                .any(|p| value.starts_with(p.as_str()))
    }
}

/// One `(identifier, column)` pair read from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: i64,
    pub value: Option<String>,
}

// ============================================================================
// SecretStore
// ============================================================================

/// Reads and writes a single column of a table.
///
/// Selections are ordered by identifier. Writes issued between [`begin`] and
/// [`commit`] become visible together or, after [`rollback`], not at all.
///
/// [`begin`]: SecretStore::begin
/// [`commit`]: SecretStore::commit
/// [`rollback`]: SecretStore::rollback
pub trait SecretStore {
    fn table_exists(&self, table: &str) -> Result<bool>;

    /// Rows whose value satisfies `filter`.
    fn select_stale(&self, col: &ColumnRef, filter: &StaleFilter) -> Result<Vec<StoredRow>>;

    /// Smallest and largest identifier, or `None` for an empty table.
    fn id_bounds(&self, col: &ColumnRef) -> Result<Option<(i64, i64)>>;

    fn select_stale_in_window(
        &self,
        col: &ColumnRef,
        filter: &StaleFilter,
        window: IdWindow,
    ) -> Result<Vec<StoredRow>>;

    /// Every row, for columns whose ciphertext is embedded in a larger value.
    fn select_all(&self, col: &ColumnRef) -> Result<Vec<StoredRow>>;

    fn select_all_in_window(&self, col: &ColumnRef, window: IdWindow) -> Result<Vec<StoredRow>>;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn update_value(&self, col: &ColumnRef, id: i64, value: &str) -> Result<()>;

    /// Insert-or-update keyed by identifier, as few statements as possible.
    fn upsert_values(&self, col: &ColumnRef, rows: &[(i64, String)]) -> Result<()>;

    /// Run `f` between `begin` and `commit`, rolling back if `f` or the
    /// commit fails. The store accepts a new transaction either way.
    fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce(&Self) -> Result<T>,
    {
        self.begin()?;
        let result = f(self).and_then(|v| self.commit().map(|()| v));
        if result.is_err() {
            if let Err(rollback_err) = self.rollback() {
                warn!(error = %rollback_err, "rollback failed");
            }
        }
        result
    }
}
