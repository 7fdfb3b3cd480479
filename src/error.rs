use thiserror::Error;

use crate::orchestrator::RotationState;

#[derive(Debug, Error)]
pub enum RekeyError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unknown key version {0}")]
    UnknownKeyVersion(u32),

    #[error("Key version {0} has been invalidated")]
    InvalidatedKeyUsed(u32),

    #[error("Decryption failed under key version {key_version}: {reason}")]
    DecryptionFailure { key_version: u32, reason: String },

    #[error("Cannot invalidate when there is only one key")]
    InsufficientKeys,

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Rotation failed after reaching {state:?}: {source}")]
    RotationFailed {
        state: RotationState,
        #[source]
        source: Box<RekeyError>,
    },

    #[error("Crypto error: {0}")]
    Crypto(#[from] rekey_crypto::CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RekeyError>;

impl RekeyError {
    /// Soft failures are recorded per value and never abort a batch.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            RekeyError::MalformedEnvelope(_) | RekeyError::DecryptionFailure { .. }
        )
    }

    /// Process exit status for this error. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            RekeyError::Config(_) => 1,
            RekeyError::InvalidArgument(_) => 2,
            RekeyError::MalformedEnvelope(_) => 3,
            RekeyError::UnknownKeyVersion(_) => 4,
            RekeyError::InvalidatedKeyUsed(_) => 5,
            RekeyError::DecryptionFailure { .. } => 6,
            RekeyError::InsufficientKeys => 7,
            RekeyError::UnsupportedOperation(_) => 8,
            RekeyError::InvalidKeyMaterial(_) => 9,
            RekeyError::WriteConflict(_) => 10,
            RekeyError::StorageUnavailable(_) => 11,
            RekeyError::RotationFailed { source, .. } => source.exit_code(),
            RekeyError::Crypto(_) => 12,
            RekeyError::Json(_) => 13,
            RekeyError::Io(_) => 14,
        }
    }
}

impl From<rusqlite::Error> for RekeyError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::ConstraintViolation) => RekeyError::WriteConflict(err.to_string()),
            _ => RekeyError::StorageUnavailable(err.to_string()),
        }
    }
}
