//! Command-line surface of the `rekey` binary.
//!
//! ```text
//! rekey [OPTIONS] <COMMAND>
//!
//! Commands:
//!   generate               Append a key and re-encrypt every known surface
//!   invalidate             Tombstone every key but the latest
//!   reencrypt-column       Re-encrypt one table column
//!   reencrypt-config-data  Re-encrypt config values the rotation leaves alone
//!   reencrypt-two-factor   Re-encrypt two-factor provider configs
//!   env-keys               Report environment values still under old keys
//!   fingerprint            Keyed hash through the hash-only view
//! ```
//!
//! Mutating commands other than `generate` and `invalidate` are dry runs
//! unless `--force` is given.

pub mod handler;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "rekey")]
#[command(version)]
#[command(about = "Rotate encryption keys and re-encrypt data stored under old keys")]
pub struct Cli {
    /// Deployment configuration JSON (env: REKEY_CONFIG)
    #[arg(short, long, env = "REKEY_CONFIG")]
    pub config: PathBuf,

    /// SQLite database (env: REKEY_DATABASE)
    #[arg(short, long, env = "REKEY_DATABASE")]
    pub database: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,

    /// Debug logging and full error chains
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Append a new key and re-encrypt every known surface under it
    Generate {
        /// Required; key rotation cannot be undone
        #[arg(long)]
        force: bool,
        /// Use this 32 character key instead of a random one
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        skip_saved_credit_cards: bool,
        /// Finish an interrupted rotation with the latest key instead of
        /// appending another
        #[arg(long, conflicts_with = "key")]
        resume: bool,
    },

    /// Tombstone every key except the latest
    Invalidate {
        /// Required; invalidated keys can no longer decrypt
        #[arg(long)]
        force: bool,
    },

    /// Re-encrypt one table column
    ReencryptColumn {
        table: String,
        identifier: String,
        column: String,
        /// Write changes instead of listing them
        #[arg(long)]
        force: bool,
        /// Process the identifier range in windows of this many ids
        #[arg(long, value_name = "N")]
        window: Option<u64>,
        /// Write each window with one upsert statement
        #[arg(long, requires = "window")]
        bulk: bool,
        /// The column holds JSON with ciphertext at this dotted path
        #[arg(long, value_name = "PATH", conflicts_with = "encrypted_json")]
        field: Option<String>,
        /// The column holds ciphertext of a JSON document with nested ciphertext
        #[arg(long)]
        encrypted_json: bool,
    },

    /// Re-encrypt system config values outside the known paths
    ReencryptConfigData {
        #[arg(long)]
        force: bool,
    },

    /// Re-encrypt two-factor provider configurations
    ReencryptTwoFactor {
        #[arg(long)]
        force: bool,
    },

    /// List environment overrides still encrypted under old keys
    EnvKeys {
        /// Include decrypted values in the listing
        #[arg(long)]
        show_decrypted: bool,
    },

    /// Keyed hash of DATA under the pinned hash key version
    Fingerprint { data: String },
}
