//! Vault error types.

use parley_crypto::CryptoError;
use thiserror::Error;

/// Errors from storage and secure-store backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),

    /// The backend cannot be used on this device.
    ///
    /// Returned by secure stores that have no platform keystore. The vault
    /// treats it as a signal to fall back, not as a failure.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by [`crate::KeyVault`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Underlying storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Session id is empty or contains a path separator.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Persisted key material has the wrong shape.
    #[error("corrupt key material for session {session_id}: {reason}")]
    CorruptKey {
        /// Session whose key could not be reconstructed
        session_id: String,
        /// What was wrong with it
        reason: String,
    },

    /// Backup bundle could not be produced or opened.
    #[error("backup failed: {0}")]
    Backup(String),

    /// Cryptographic failure while sealing or opening a backup.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
