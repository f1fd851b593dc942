//! Ordinary key-value storage for the vault.
//!
//! Trait-based abstraction so the vault can run against an in-memory map in
//! tests and a durable database on a device. The trait is synchronous: every
//! vault operation is a handful of small reads and writes.

mod memory;
mod redb;

pub use memory::MemoryStorage;

pub use self::redb::RedbStorage;
use crate::error::StorageError;

/// A single write inside a [`Storage::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite `key`.
    Put {
        /// Record key
        key: String,
        /// Record value
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Delete {
        /// Record key
        key: String,
    },
}

impl WriteOp {
    /// Build a put.
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put { key: key.into(), value: value.into() }
    }

    /// Build a delete.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Key-value storage with atomic batches.
///
/// Must be Clone (shared by the vault and anyone inspecting it), Send + Sync
/// and synchronous. Implementations share internal state via Arc, so clones
/// see the same records.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply every operation or none of them.
    ///
    /// Operations apply in order, so a later op on the same key wins.
    fn write_batch(&self, ops: &[WriteOp]) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Insert or overwrite a single record.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.write_batch(&[WriteOp::put(key, value)])
    }

    /// Remove a single record. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.write_batch(&[WriteOp::delete(key)])
    }
}
