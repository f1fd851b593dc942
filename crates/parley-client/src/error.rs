//! Client error types.

use parley_core::TransportError;
use parley_crypto::CryptoError;
use parley_vault::VaultError;
use thiserror::Error;

use crate::event::SessionState;

/// Errors from the session coordinator and the realtime driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Cryptographic operation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Key vault failed.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Transport rejected the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No usable session key for this peer.
    #[error("no active session with {peer}")]
    NoSession {
        /// Peer identity
        peer: String,
    },

    /// The stored session outlived the maximum key age and was dropped.
    #[error("session with {peer} expired")]
    SessionExpired {
        /// Peer identity
        peer: String,
    },

    /// The requested operation is not valid in the session's current state.
    #[error("session with {peer} is {state:?}")]
    InvalidState {
        /// Peer identity
        peer: String,
        /// State the session was in
        state: SessionState,
    },

    /// Peer identity is empty or our own.
    #[error("invalid peer: {0:?}")]
    InvalidPeer(String),

    /// The driver task has stopped.
    #[error("realtime driver stopped")]
    DriverStopped,
}
