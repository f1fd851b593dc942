//! Parley core.
//!
//! Everything here is deterministic given an [`env::Environment`]: the crypto
//! engine draws randomness and time from it, and the transport state machine
//! takes time as a parameter and returns actions instead of performing I/O.
//!
//! # Components
//!
//! - [`engine::CryptoEngine`]: key pairs, cached key derivation, encryption
//!   with cipher fallback, fingerprints
//! - [`transport::Transport`]: connection lifecycle, keepalive, bounded
//!   backoff, offline queue
//! - [`bus::EventBus`]: typed, fault-isolated event dispatch

#![forbid(unsafe_code)]

pub mod bus;
pub mod engine;
pub mod env;
pub mod error;
pub mod transport;

pub use bus::{BusEvent, DispatchReport, EventBus, HandlerError, SubscriptionId};
pub use engine::{CryptoEngine, EngineConfig, detect_preferred_algorithm};
pub use env::{EntropyError, Environment};
pub use error::TransportError;
pub use transport::{
    ConnectFailure, ConnectionState, Transport, TransportAction, TransportConfig, TransportEvent,
    TransportEventKind,
};
