//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety, so a
//! session key and its metadata are either both on disk or neither is.

use std::{path::Path, sync::Arc};

use redb::{Database, TableDefinition};

use super::{Storage, WriteOp};
use crate::error::StorageError;

/// Table: records
/// Key: namespaced record key (`meta/{session}`, `key/{session}`, ...)
/// Value: raw bytes (CBOR for structured records)
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;

        let value = table.get(key).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn write_batch(&self, ops: &[WriteOp]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;

            for op in ops {
                match op {
                    WriteOp::Put { key, value } => {
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(|e| StorageError::Io(e.to_string()))?;
                    },
                    WriteOp::Delete { key } => {
                        table.remove(key.as_str()).map_err(|e| StorageError::Io(e.to_string()))?;
                    },
                }
            }
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;

        let results = table.range(prefix..).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut keys = Vec::new();
        for result in results {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }

        Ok(keys)
    }
}
