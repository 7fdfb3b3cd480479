use serde::Serialize;

/// One prospective or applied change. Never carries plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueChange {
    pub id: i64,
    pub old_ciphertext: String,
    pub new_ciphertext: String,
}

/// Outcome of scanning one table column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub table: String,
    pub column: String,
    pub latest_version: u32,
    pub dry_run: bool,
    /// Rows handed to the row transform.
    pub scanned: usize,
    /// Rows written, or that would be written in a dry run.
    pub updated: usize,
    /// NULL or empty values.
    pub skipped_empty: usize,
    /// Values already under the latest key.
    pub skipped_current: usize,
    /// Values that hold no ciphertext at all.
    pub skipped_plaintext: usize,
    /// Soft failures: undecryptable or malformed values left as they were.
    pub failures: usize,
    /// Windows processed; zero in whole-table mode.
    pub windows: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<ValueChange>,
}

impl ScanReport {
    pub fn new(table: &str, column: &str, latest_version: u32, dry_run: bool) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            latest_version,
            dry_run,
            ..Self::default()
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failures > 0
    }

    /// Fold another report for the same column into this one.
    pub(crate) fn absorb(&mut self, other: ScanReport) {
        self.scanned += other.scanned;
        self.updated += other.updated;
        self.skipped_empty += other.skipped_empty;
        self.skipped_current += other.skipped_current;
        self.skipped_plaintext += other.skipped_plaintext;
        self.failures += other.failures;
        self.windows += other.windows;
        self.changes.extend(other.changes);
    }
}
