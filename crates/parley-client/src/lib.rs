//! Parley client.
//!
//! Session coordination for end-to-end encrypted chat: per-peer key exchange,
//! rotation, handshake timeouts and the encrypt/decrypt path that keeps keys
//! in the vault.
//!
//! # Architecture
//!
//! [`SessionCoordinator`] follows the same Sans-IO pattern as
//! [`parley_core::Transport`]. Inbound messages and the current time go in;
//! [`CoordinatorAction`]s come out for the caller to send or surface.
//!
//! # Transport (optional)
//!
//! With the `transport` feature enabled, [`transport::RealtimeClient`] drives
//! the transport state machine over a websocket.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod coordinator;
mod error;
mod event;
mod system_env;

#[cfg(feature = "transport")]
pub mod transport;

pub use coordinator::{
    CoordinatorConfig, DEFAULT_HANDSHAKE_TIMEOUT, SessionCoordinator, session_id_for,
};
pub use error::ClientError;
pub use event::{CoordinatorAction, DecryptedMessage, MessageBody, SessionEvent, SessionState};
pub use parley_core::env::Environment;
pub use system_env::SystemEnv;
