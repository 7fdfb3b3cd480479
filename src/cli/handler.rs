//! Command handlers.

use std::path::Path;

use tracing::{info, warn};

use crate::cache::NoopCache;
use crate::cli::output::{self, print_json};
use crate::cli::{Cli, Commands};
use crate::config::{ConfigWriter, DeploymentConfig, JsonFileWriter};
use crate::encryptor::Encryptor;
use crate::env::EnvReporter;
use crate::error::{RekeyError, Result};
use crate::hasher::fingerprint_hasher;
use crate::keyring::KeyMaterial;
use crate::orchestrator::{invalidate_old_keys, KeyRotation, RotationOptions};
use crate::scanner::{ColumnEncoding, ScanMode, ScanOptions, TableScanner, TableTarget, WindowWrite};
use crate::storage::SqliteStore;

/// Run the CLI with parsed arguments.
pub fn run(cli: Cli) -> Result<()> {
    let Cli {
        config,
        database,
        json,
        command,
        ..
    } = cli;
    let writer = JsonFileWriter::new(config);
    let database = database.as_deref();
    match command {
        Commands::Generate {
            force,
            key,
            skip_saved_credit_cards,
            resume,
        } => {
            require_force(force, "Key rotation cannot be undone")?;
            let store = open_store(database)?;
            let options = RotationOptions {
                new_key: key.map(KeyMaterial::new).transpose()?,
                skip_saved_credit_cards,
                resume,
            };
            let report = KeyRotation::new(&store, &writer, &NoopCache).run(options)?;
            if report.failures() > 0 {
                warn!(failures = report.failures(), "some values could not be re-encrypted");
            }
            emit(json, &report, output::rotation_summary)
        }

        Commands::Invalidate { force } => {
            require_force(
                force,
                "Invalidated keys can no longer decrypt anything still encrypted under them",
            )?;
            let report = invalidate_old_keys(&writer, &NoopCache)?;
            emit(json, &report, output::invalidation_summary)
        }

        Commands::ReencryptColumn {
            table,
            identifier,
            column,
            force,
            window,
            bulk,
            field,
            encrypted_json,
        } => {
            let mut target = TableTarget::user_column(&table, &identifier, &column)?;
            if let Some(path) = field {
                target = target.with_encoding(ColumnEncoding::JsonField(path));
            } else if encrypted_json {
                target = target.with_encoding(ColumnEncoding::EncryptedJson);
            }
            let mode = match window {
                Some(size) => ScanMode::Windowed {
                    size,
                    write: if bulk {
                        WindowWrite::BulkUpsert
                    } else {
                        WindowWrite::PerRow
                    },
                },
                None => ScanMode::WholeTable,
            };
            let options = ScanOptions::default().with_mode(mode).with_dry_run(!force);
            scan(database, json, &writer, &target, options, "reencrypt_column")
        }

        Commands::ReencryptConfigData { force } => {
            let options = ScanOptions::default().with_dry_run(!force);
            scan(
                database,
                json,
                &writer,
                &TableTarget::unhandled_config_data(),
                options,
                "reencrypt_config_data",
            )
        }

        Commands::ReencryptTwoFactor { force } => {
            let options = ScanOptions::default().with_dry_run(!force);
            scan(
                database,
                json,
                &writer,
                &TableTarget::two_factor_configs(),
                options,
                "reencrypt_two_factor",
            )
        }

        Commands::EnvKeys { show_decrypted } => {
            let config = writer.load()?;
            let ring = config.key_ring()?;
            let cipher = Encryptor::new(&ring)
                .with_audit(config.decrypt_audit())
                .with_context("env_keys");
            let report = EnvReporter::new(&cipher)
                .show_decrypted(show_decrypted)
                .report(std::env::vars())?;
            emit(json, &report, output::env_summary)
        }

        Commands::Fingerprint { data } => {
            let config = writer.load()?;
            let digest = fingerprint(&config, &data)?;
            println!("{digest}");
            Ok(())
        }
    }
}

fn require_force(force: bool, consequence: &str) -> Result<()> {
    if force {
        return Ok(());
    }
    Err(RekeyError::InvalidArgument(format!(
        "{consequence}. Run again with --force to proceed"
    )))
}

fn open_store(path: Option<&Path>) -> Result<SqliteStore> {
    let path = path.ok_or_else(|| {
        RekeyError::InvalidArgument("Provide the database with --database or REKEY_DATABASE".into())
    })?;
    SqliteStore::open(path)
}

fn scan(
    database: Option<&Path>,
    json: bool,
    writer: &JsonFileWriter,
    target: &TableTarget,
    options: ScanOptions,
    context: &'static str,
) -> Result<()> {
    let config = writer.load()?;
    let ring = config.key_ring()?;
    let cipher = Encryptor::new(&ring)
        .with_audit(config.decrypt_audit())
        .with_context(context);
    let store = open_store(database)?;
    let report = TableScanner::new(&store, &cipher).run(target, &options)?;
    if report.dry_run && report.updated > 0 {
        info!("dry run; pass --force to write these changes");
    }
    emit(json, &report, output::scan_summary)
}

/// Fingerprint `data` with the key pinned by `crypt/hash_key_version`.
pub fn fingerprint(config: &DeploymentConfig, data: &str) -> Result<String> {
    let ring = config.key_ring()?;
    let hasher = fingerprint_hasher(&ring, config.hash_key_version()?)?;
    hasher.hash(data)
}

fn emit<T: serde::Serialize>(json: bool, report: &T, summary: fn(&T) -> String) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!("{}", summary(report));
    Ok(())
}
