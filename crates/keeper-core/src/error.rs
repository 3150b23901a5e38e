use keeper_crypto::CryptoError;
use thiserror::Error;

use crate::migration::MigrationStage;

/// Failure taxonomy surfaced to the host layer.
///
/// The `Display` text of every variant is safe to show to the user. Raw
/// causes stay in variant fields and go to the diagnostic log only; they may
/// contain paths or cipher internals.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error(
        "passphrase must be at least {} characters",
        keeper_crypto::kdf::MIN_PASSPHRASE_CHARS
    )]
    WeakPassphrase,

    #[error("incorrect passphrase")]
    InvalidPassphrase,

    #[error("recovery credential not recognised")]
    InvalidRecoveryCredential,

    #[error("too many recovery attempts, try again in {remaining_ms} ms")]
    RecoveryThrottled { remaining_ms: u64 },

    #[error("no recovery credential has been set up for this store")]
    RecoveryNotConfigured,

    #[error("recovery data is corrupted; restore from a backup to use recovery")]
    MetadataCorrupted,

    #[error("backup could not be completed, nothing was changed")]
    BackupFailed(String),

    #[error("migration failed and your data was restored to its previous state")]
    MigrationFailed {
        stage: MigrationStage,
        cause: String,
    },

    #[error("another migration or rotation is already in progress, wait and retry")]
    LockContention,

    #[error("no store was found at the configured location")]
    StoreMissing,

    #[error("the store is damaged and cannot be opened")]
    StoreInconsistent(String),

    #[error("an internal error occurred")]
    Internal(String),
}

impl KeeperError {
    /// Raw detail string for embedding in a `MigrationFailed` cause. Log
    /// material, not display material.
    pub(crate) fn internal_detail(&self) -> String {
        match self {
            KeeperError::StoreInconsistent(detail)
            | KeeperError::BackupFailed(detail)
            | KeeperError::Internal(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}

impl From<CryptoError> for KeeperError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::WeakPassphrase { .. } => KeeperError::WeakPassphrase,
            other => KeeperError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for KeeperError {
    fn from(e: std::io::Error) -> Self {
        KeeperError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for KeeperError {
    fn from(e: serde_json::Error) -> Self {
        KeeperError::Internal(e.to_string())
    }
}
