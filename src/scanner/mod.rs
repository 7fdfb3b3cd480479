//! Batch table scanner: finds stale ciphertext in one column and rewrites it
//! under the latest key.
//!
//! Whole-table mode reads, transforms and writes inside a single transaction,
//! so a fatal error leaves the table exactly as it was. Windowed mode walks
//! the identifier range in fixed-size windows, each its own transaction;
//! windows committed before a failure stay committed. Dry runs compute every
//! new value and write nothing.

pub mod report;
pub mod window;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::encryptor::SecretCipher;
use crate::envelope::{is_current, looks_like_ciphertext, peek_key_version};
use crate::error::{RekeyError, Result};
use crate::field::{reencrypt_field, FieldOutcome, SkipReason};
use crate::storage::{ColumnRef, IdWindow, SecretStore, StaleFilter, StoredRow};
use crate::walker::StructuralReencryptor;

pub use report::{ScanReport, ValueChange};
pub use window::{plan_windows, WindowPlan};

// ============================================================================
// Known surfaces
// ============================================================================

pub const CONFIG_TABLE: &str = "core_config_data";
pub const TWO_FACTOR_TABLE: &str = "tfa_user_config";
pub const CREDIT_CARD_TABLE: &str = "sales_order_payment";

/// Tables with a dedicated command; the generic column command refuses them.
pub const PROTECTED_TABLES: [&str; 2] = [CONFIG_TABLE, TWO_FACTOR_TABLE];

/// Prefixes of PHP-serialized arrays and strings that share the config value
/// column with ciphertext.
pub const SERIALIZED_SENTINELS: [&str; 2] = ["a:", "s:"];

// ============================================================================
// Targets
// ============================================================================

/// How ciphertext is stored in a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnEncoding {
    /// The column holds one envelope.
    Ciphertext,
    /// The column holds a JSON blob with an envelope at this dotted path.
    JsonField(String),
    /// The column holds an envelope whose plaintext is a JSON document with
    /// further envelopes nested inside.
    EncryptedJson,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub column: ColumnRef,
    pub encoding: ColumnEncoding,
    pub exclude_prefixes: Vec<String>,
}

impl TableTarget {
    pub fn new(
        table: impl Into<String>,
        identifier: impl Into<String>,
        column: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::from_column(ColumnRef::new(table, identifier, column)?))
    }

    /// A caller-named column. Tables with a dedicated command are refused.
    pub fn user_column(table: &str, identifier: &str, column: &str) -> Result<Self> {
        if PROTECTED_TABLES.contains(&table) {
            return Err(RekeyError::InvalidArgument(format!(
                "You cannot use this command for the {table} table"
            )));
        }
        Self::new(table, identifier, column)
    }

    pub fn saved_credit_cards() -> Self {
        Self::from_column(known_column(CREDIT_CARD_TABLE, "entity_id", "cc_number_enc"))
    }

    pub fn unhandled_config_data() -> Self {
        Self::from_column(known_column(CONFIG_TABLE, "config_id", "value"))
            .excluding(SERIALIZED_SENTINELS)
    }

    pub fn two_factor_configs() -> Self {
        Self::from_column(known_column(TWO_FACTOR_TABLE, "config_id", "encoded_config"))
            .with_encoding(ColumnEncoding::EncryptedJson)
    }

    pub fn with_encoding(mut self, encoding: ColumnEncoding) -> Self {
        self.encoding = encoding;
        self
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

    pub fn table(&self) -> &str {
        &self.column.table
    }

    fn from_column(column: ColumnRef) -> Self {
        Self {
            column,
            encoding: ColumnEncoding::Ciphertext,
            exclude_prefixes: Vec::new(),
        }
    }
}

fn known_column(table: &str, identifier: &str, column: &str) -> ColumnRef {
    ColumnRef {
        table: table.to_string(),
        identifier: identifier.to_string(),
        column: column.to_string(),
    }
}

// ============================================================================
// Options
// ============================================================================

/// How a window's new values are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowWrite {
    /// One UPDATE per row.
    PerRow,
    /// One insert-or-update statement per window.
    BulkUpsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    WholeTable,
    Windowed { size: u64, write: WindowWrite },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub mode: ScanMode,
    pub dry_run: bool,
    /// Record every change in the report. Dry runs always record.
    pub collect_changes: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            mode: ScanMode::WholeTable,
            dry_run: true,
            collect_changes: false,
        }
    }
}

impl ScanOptions {
    /// Whole-table mode that writes.
    pub fn apply() -> Self {
        Self {
            dry_run: false,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn records_changes(&self) -> bool {
        self.dry_run || self.collect_changes
    }
}

// ============================================================================
// Scanner
// ============================================================================

enum RowOutcome {
    Empty,
    Current,
    Plaintext,
    Failed,
    Updated {
        stored: String,
        old_ciphertext: String,
        new_ciphertext: String,
        nested_failures: usize,
    },
}

pub struct TableScanner<'a, S, C: ?Sized> {
    store: &'a S,
    cipher: &'a C,
}

impl<'a, S: SecretStore, C: SecretCipher + ?Sized> TableScanner<'a, S, C> {
    pub fn new(store: &'a S, cipher: &'a C) -> Self {
        Self { store, cipher }
    }

    pub fn run(&self, target: &TableTarget, options: &ScanOptions) -> Result<ScanReport> {
        let latest = self.cipher.latest_version();
        let mut report =
            ScanReport::new(target.table(), &target.column.column, latest, options.dry_run);

        if !self.store.table_exists(target.table())? {
            info!(table = target.table(), "table does not exist, nothing to re-encrypt");
            return Ok(report);
        }
        info!(
            table = target.table(),
            column = %target.column.column,
            latest,
            dry_run = options.dry_run,
            "looking for values under old keys"
        );

        let filter = StaleFilter::new(latest).excluding(target.exclude_prefixes.iter().cloned());
        match options.mode {
            ScanMode::WholeTable => self.run_whole_table(target, &filter, options, &mut report)?,
            ScanMode::Windowed { size, write } => {
                self.run_windowed(target, &filter, options, size, write, &mut report)?
            }
        }

        info!(
            table = target.table(),
            scanned = report.scanned,
            updated = report.updated,
            failures = report.failures,
            dry_run = report.dry_run,
            "scan finished"
        );
        Ok(report)
    }

    fn run_whole_table(
        &self,
        target: &TableTarget,
        filter: &StaleFilter,
        options: &ScanOptions,
        report: &mut ScanReport,
    ) -> Result<()> {
        if options.dry_run {
            let rows = self.select(target, filter, None)?;
            self.process_rows(target, rows, report, options)?;
            return Ok(());
        }

        self.store.transaction(|store| {
            let rows = self.select(target, filter, None)?;
            let updates = self.process_rows(target, rows, report, options)?;
            for (id, value) in &updates {
                store.update_value(&target.column, *id, value)?;
            }
            Ok(())
        })
    }

    fn run_windowed(
        &self,
        target: &TableTarget,
        filter: &StaleFilter,
        options: &ScanOptions,
        size: u64,
        write: WindowWrite,
        report: &mut ScanReport,
    ) -> Result<()> {
        let Some((min_id, max_id)) = self.store.id_bounds(&target.column)? else {
            return Ok(());
        };
        let windows = plan_windows(min_id, max_id, size)?;
        let total = windows.remaining();

        for (n, window) in windows.enumerate() {
            let mut window_report = ScanReport {
                windows: 1,
                ..ScanReport::default()
            };

            if options.dry_run {
                let rows = self.select(target, filter, Some(window))?;
                self.process_rows(target, rows, &mut window_report, options)?;
            } else {
                self.store
                    .transaction(|store| {
                        let rows = self.select(target, filter, Some(window))?;
                        let updates = self.process_rows(target, rows, &mut window_report, options)?;
                        match write {
                            WindowWrite::PerRow => {
                                for (id, value) in &updates {
                                    store.update_value(&target.column, *id, value)?;
                                }
                            }
                            WindowWrite::BulkUpsert if !updates.is_empty() => {
                                store.upsert_values(&target.column, &updates)?;
                            }
                            WindowWrite::BulkUpsert => {}
                        }
                        Ok(())
                    })
                    .inspect_err(|e| {
                        warn!(
                            window = n + 1,
                            start = window.start,
                            end = window.end,
                            error = %e,
                            "window rolled back"
                        );
                    })?;
            }

            info!(
                window = n + 1,
                of = total,
                start = window.start,
                end = window.end,
                updated = window_report.updated,
                "window done"
            );
            report.absorb(window_report);
        }
        Ok(())
    }

    fn select(
        &self,
        target: &TableTarget,
        filter: &StaleFilter,
        window: Option<IdWindow>,
    ) -> Result<Vec<StoredRow>> {
        let col = &target.column;
        match (&target.encoding, window) {
            (ColumnEncoding::JsonField(_), None) => self.store.select_all(col),
            (ColumnEncoding::JsonField(_), Some(w)) => self.store.select_all_in_window(col, w),
            (_, None) => self.store.select_stale(col, filter),
            (_, Some(w)) => self.store.select_stale_in_window(col, filter, w),
        }
    }

    /// Transform every row, returning the `(id, new stored value)` pairs.
    fn process_rows(
        &self,
        target: &TableTarget,
        rows: Vec<StoredRow>,
        report: &mut ScanReport,
        options: &ScanOptions,
    ) -> Result<Vec<(i64, String)>> {
        let mut updates = Vec::new();
        for row in rows {
            report.scanned += 1;
            match self.transform(target, row.id, row.value.as_deref())? {
                RowOutcome::Empty => report.skipped_empty += 1,
                RowOutcome::Current => report.skipped_current += 1,
                RowOutcome::Plaintext => report.skipped_plaintext += 1,
                RowOutcome::Failed => report.failures += 1,
                RowOutcome::Updated {
                    stored,
                    old_ciphertext,
                    new_ciphertext,
                    nested_failures,
                } => {
                    debug!(table = target.table(), id = row.id, "re-encrypted");
                    report.updated += 1;
                    report.failures += nested_failures;
                    if options.records_changes() {
                        report.changes.push(ValueChange {
                            id: row.id,
                            old_ciphertext,
                            new_ciphertext,
                        });
                    }
                    updates.push((row.id, stored));
                }
            }
        }
        Ok(updates)
    }

    /// Soft failures become [`RowOutcome::Failed`]; anything else aborts.
    fn transform(&self, target: &TableTarget, id: i64, value: Option<&str>) -> Result<RowOutcome> {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            return Ok(RowOutcome::Empty);
        };
        let result = match &target.encoding {
            ColumnEncoding::Ciphertext => self.reencrypt_value(value),
            ColumnEncoding::JsonField(path) => self.reencrypt_json_field(value, path),
            ColumnEncoding::EncryptedJson => self.reencrypt_encrypted_json(value),
        };
        match result {
            Err(e) if e.is_soft() || matches!(e, RekeyError::Json(_)) => {
                warn!(table = target.table(), id, error = %e, "value left unchanged");
                Ok(RowOutcome::Failed)
            }
            other => other,
        }
    }

    fn reencrypt_value(&self, value: &str) -> Result<RowOutcome> {
        if !looks_like_ciphertext(value) {
            return Ok(RowOutcome::Plaintext);
        }
        if is_current(value, self.cipher.latest_version()) {
            return Ok(RowOutcome::Current);
        }
        let plaintext = self.decrypt_non_empty(value)?;
        let new_ciphertext = self.cipher.encrypt(&plaintext)?;
        Ok(RowOutcome::Updated {
            stored: new_ciphertext.clone(),
            old_ciphertext: value.to_string(),
            new_ciphertext,
            nested_failures: 0,
        })
    }

    fn reencrypt_json_field(&self, value: &str, path: &str) -> Result<RowOutcome> {
        Ok(match reencrypt_field(value, path, self.cipher)? {
            FieldOutcome::Updated {
                blob,
                old_ciphertext,
                new_ciphertext,
            } => RowOutcome::Updated {
                stored: blob,
                old_ciphertext,
                new_ciphertext,
                nested_failures: 0,
            },
            FieldOutcome::Skipped(SkipReason::Empty) => RowOutcome::Empty,
            FieldOutcome::Skipped(SkipReason::NotCiphertext) => RowOutcome::Plaintext,
            FieldOutcome::Skipped(SkipReason::AlreadyCurrent) => RowOutcome::Current,
        })
    }

    fn reencrypt_encrypted_json(&self, value: &str) -> Result<RowOutcome> {
        if !looks_like_ciphertext(value) {
            return Ok(RowOutcome::Plaintext);
        }
        if is_current(value, self.cipher.latest_version()) {
            return Ok(RowOutcome::Current);
        }
        let plaintext = self.decrypt_non_empty(value)?;
        let document: Value = serde_json::from_str(&plaintext)?;

        let mut walker = StructuralReencryptor::new(self.cipher);
        let document = walker.walk(document);
        if walker.has_failures() {
            warn!(failures = walker.failures(), "nested values left under old keys");
        }

        let new_ciphertext = self.cipher.encrypt(&serde_json::to_string(&document)?)?;
        Ok(RowOutcome::Updated {
            stored: new_ciphertext.clone(),
            old_ciphertext: value.to_string(),
            new_ciphertext,
            nested_failures: walker.failures(),
        })
    }

    fn decrypt_non_empty(&self, value: &str) -> Result<String> {
        let plaintext = self.cipher.decrypt(value)?;
        if plaintext.is_empty() {
            return Err(RekeyError::DecryptionFailure {
                key_version: peek_key_version(value).unwrap_or_default(),
                reason: "decrypted to an empty value".into(),
            });
        }
        Ok(plaintext)
    }
}
