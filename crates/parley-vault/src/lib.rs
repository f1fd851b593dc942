//! Parley key vault.
//!
//! Persists session keys so conversations survive restarts. Keys prefer the
//! platform secure store; when it is missing or failing they are obfuscated
//! with a per-device key and written to ordinary storage instead. Both paths
//! record metadata (creation time, cipher, commitment, status, path) so keys
//! can be aged out and re-negotiated.
//!
//! # Backends
//!
//! - [`Storage`]: ordinary key-value records. [`MemoryStorage`] for tests,
//!   [`RedbStorage`] for durable on-device storage.
//! - [`SecureStore`]: platform keystore. [`MemorySecureStore`],
//!   [`UnavailableSecureStore`] and [`ChaoticSecureStore`] for fault
//!   injection.

#![forbid(unsafe_code)]

pub mod error;
pub mod metadata;
pub mod secure;
pub mod storage;
pub mod vault;

pub use error::{StorageError, VaultError};
pub use metadata::{KeyInfo, PendingRecord, SessionMetadata, SessionStatus, StoragePath};
pub use secure::{ChaoticSecureStore, MemorySecureStore, SecureStore, UnavailableSecureStore};
pub use storage::{MemoryStorage, RedbStorage, Storage, WriteOp};
pub use vault::{
    DEFAULT_KEY_CACHE_TTL, DEFAULT_MAX_SESSION_AGE, KeyVault, PendingExchange, VaultConfig,
};
