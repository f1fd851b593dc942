//! Platform secure stores.
//!
//! A secure store keeps secret bytes somewhere the OS protects (keychain,
//! keystore, TPM). Not every device has one, so the vault treats every error
//! from this trait as "use the obfuscated fallback" rather than as fatal.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

mod chaotic;

pub use chaotic::ChaoticSecureStore;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use zeroize::Zeroizing;

use crate::error::StorageError;

/// Secret storage backed by a platform keystore.
pub trait SecureStore: Clone + Send + Sync + 'static {
    /// Store `secret` under `id`, replacing any previous value.
    fn store(&self, id: &str, secret: &[u8]) -> Result<(), StorageError>;

    /// Secret stored under `id`, if any.
    fn load(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError>;

    /// Remove `id`. Removing a missing id is not an error.
    fn remove(&self, id: &str) -> Result<(), StorageError>;
}

/// In-process secure store.
///
/// Stands in for a platform keystore in tests and on hosts where the caller
/// accepts that secrets live only as long as the process.
#[derive(Clone, Default)]
pub struct MemorySecureStore {
    inner: Arc<Mutex<HashMap<String, Zeroizing<Vec<u8>>>>>,
}

impl MemorySecureStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of secrets held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no secrets are held.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Zeroizing<Vec<u8>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecureStore for MemorySecureStore {
    fn store(&self, id: &str, secret: &[u8]) -> Result<(), StorageError> {
        self.lock().insert(id.to_string(), Zeroizing::new(secret.to_vec()));
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        Ok(self.lock().get(id).cloned())
    }

    fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.lock().remove(id);
        Ok(())
    }
}

/// Secure store for devices without a platform keystore.
///
/// Every call fails with [`StorageError::Unavailable`], which routes all keys
/// through the obfuscated path.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableSecureStore;

impl SecureStore for UnavailableSecureStore {
    fn store(&self, _id: &str, _secret: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("no platform secure store".to_string()))
    }

    fn load(&self, _id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        Err(StorageError::Unavailable("no platform secure store".to_string()))
    }

    fn remove(&self, _id: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("no platform secure store".to_string()))
    }
}
