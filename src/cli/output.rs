//! Report printing for the CLI: pretty JSON with `--json`, short text otherwise.

use serde::Serialize;

use crate::env::EnvReport;
use crate::error::Result;
use crate::orchestrator::{InvalidationReport, RotationReport};
use crate::scanner::ScanReport;

pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

pub fn scan_summary(report: &ScanReport) -> String {
    let mut out = format!(
        "{}.{}: scanned {}, {} {}, already current {}, empty {}, not encrypted {}, failed {}",
        report.table,
        report.column,
        report.scanned,
        if report.dry_run { "would update" } else { "updated" },
        report.updated,
        report.skipped_current,
        report.skipped_empty,
        report.skipped_plaintext,
        report.failures,
    );
    if report.windows > 0 {
        out.push_str(&format!(" ({} windows)", report.windows));
    }
    for change in &report.changes {
        out.push_str(&format!(
            "\n  {}: {} -> {}",
            change.id, change.old_ciphertext, change.new_ciphertext
        ));
    }
    out
}

pub fn rotation_summary(report: &RotationReport) -> String {
    let mut lines = vec![
        format!(
            "Key version {} -> {}",
            report.previous_version, report.latest_version
        ),
        format!(
            "System config: {} re-encrypted in {} rows, {} failed",
            report.system_config.reencrypted,
            report.system_config_rows_updated,
            report.system_config.failures
        ),
    ];
    match &report.saved_credit_cards {
        Some(scan) => lines.push(format!("Saved credit cards: {}", scan_summary(scan))),
        None => lines.push("Saved credit cards: skipped".to_string()),
    }
    lines.push(format!(
        "Environment segment: {} re-encrypted, {} failed",
        report.env_segment.reencrypted, report.env_segment.failures
    ));
    lines.join("\n")
}

pub fn invalidation_summary(report: &InvalidationReport) -> String {
    if report.invalidated.is_empty() {
        return "No further keys need invalidating".to_string();
    }
    let versions: Vec<String> = report.invalidated.iter().map(u32::to_string).collect();
    format!(
        "Invalidated key versions {}; version {} is the only active key",
        versions.join(", "),
        report.latest_version
    )
}

pub fn env_summary(report: &EnvReport) -> String {
    if report.is_empty() {
        return "No environment values are encrypted under old keys".to_string();
    }
    let mut lines = Vec::new();
    for (name, change) in &report.changes {
        lines.push(format!("{name}={}", change.new_ciphertext));
        if let Some(path) = &change.config_path {
            lines.push(format!("  config path: {path}"));
        }
        lines.push(format!("  was: {}", change.old_ciphertext));
        if let Some(plaintext) = &change.decrypted_preview {
            lines.push(format!("  decrypted: {plaintext}"));
        }
    }
    for failure in &report.failures {
        lines.push(format!("{}: {}", failure.name, failure.error));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ValueChange;

    #[test]
    fn dry_run_summary_lists_changes() {
        let mut report = ScanReport::new("orders", "card", 1, true);
        report.scanned = 2;
        report.updated = 1;
        report.skipped_current = 1;
        report.changes.push(ValueChange {
            id: 7,
            old_ciphertext: "0:1:old".into(),
            new_ciphertext: "1:1:new".into(),
        });
        let text = scan_summary(&report);
        assert!(text.starts_with("orders.card: scanned 2, would update 1"));
        assert!(text.ends_with("\n  7: 0:1:old -> 1:1:new"));
    }

    #[test]
    fn nothing_to_invalidate() {
        let report = InvalidationReport {
            latest_version: 2,
            invalidated: vec![],
        };
        assert_eq!(invalidation_summary(&report), "No further keys need invalidating");
        let report = InvalidationReport {
            latest_version: 2,
            invalidated: vec![0, 1],
        };
        assert!(invalidation_summary(&report).starts_with("Invalidated key versions 0, 1;"));
    }
}
