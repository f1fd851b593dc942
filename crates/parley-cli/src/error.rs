//! Errors that end the chat session.

use parley_client::ClientError;
use parley_vault::VaultError;
use thiserror::Error;

/// Fatal client errors.
#[derive(Error, Debug)]
pub enum CliError {
    /// Coordinator or driver failure.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Vault failure outside the coordinator (backup, startup).
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Terminal or file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Backup file is not valid JSON.
    #[error("backup file: {0}")]
    Backup(#[from] serde_json::Error),

    /// The server refused the credential.
    #[error("credential rejected, restart with a fresh token")]
    AuthExpired,

    /// Reconnect budget exhausted.
    #[error("server unreachable after {attempts} reconnect attempts")]
    ConnectionLost {
        /// Attempts made
        attempts: u32,
    },
}
