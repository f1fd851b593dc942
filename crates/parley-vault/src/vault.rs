//! Session key vault.
//!
//! Keys go to the platform secure store when it works. When it does not, the
//! key is XORed with a per-device random obfuscation key and written to
//! ordinary storage. Either way a metadata record names the path used, so
//! reads never have to guess.
//!
//! # Record layout
//!
//! ```text
//! meta/{session}      CBOR SessionMetadata
//! key/{session}       obfuscated session key (obfuscated path only)
//! pending/{session}   CBOR PendingRecord
//! pendkey/{session}   obfuscated handshake secret (obfuscated path only)
//! device/obfuscation  32 random bytes, created on first fallback
//! ```
//!
//! Secure-store ids are `session:{session}` and `pending:{session}`.
//!
//! # Concurrency
//!
//! Every operation on a session id holds that id's lock for its duration, so
//! a concurrent store and delete on the same session never interleave.
//! Different sessions proceed in parallel.

#![allow(clippy::disallowed_types, reason = "Per-session locks guard short synchronous sections")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use hkdf::Hkdf;
use parley_core::env::Environment;
use parley_crypto::{
    Algorithm, EncryptedEnvelope, KEY_SIZE, KeyPair, SecretKey, SessionKey, open_envelope,
    seal_envelope,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::{StorageError, VaultError},
    metadata::{
        KeyInfo, PendingRecord, SessionMetadata, SessionStatus, StoragePath, from_cbor, to_cbor,
    },
    secure::SecureStore,
    storage::{Storage, WriteOp},
};

/// Default lifetime of a cached key (5 minutes).
pub const DEFAULT_KEY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Default maximum session age (7 days).
pub const DEFAULT_MAX_SESSION_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const META_PREFIX: &str = "meta/";
const KEY_PREFIX: &str = "key/";
const PENDING_PREFIX: &str = "pending/";
const PENDING_KEY_PREFIX: &str = "pendkey/";
const DEVICE_KEY: &str = "device/obfuscation";

const BACKUP_SALT: &[u8] = b"parley-backup-salt-v1";
const BACKUP_INFO: &[u8] = b"parley backup key";
const BACKUP_VERSION: u8 = 1;

/// Vault configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    /// How long a key read from storage is served from memory
    pub cache_ttl: Duration,
    /// Sessions older than this are purged and must be re-negotiated
    pub max_session_age: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self { cache_ttl: DEFAULT_KEY_CACHE_TTL, max_session_age: DEFAULT_MAX_SESSION_AGE }
    }
}

/// A handshake restored from the vault.
#[derive(Debug, Clone)]
pub struct PendingExchange {
    /// Peer the handshake is with
    pub peer: String,
    /// Unix milliseconds when the handshake started
    pub created: u64,
    /// Whether this handshake replaces an existing key
    pub rotation: bool,
    /// Our ephemeral key pair
    pub key_pair: KeyPair,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupEntry {
    session_id: String,
    key: Vec<u8>,
    metadata: SessionMetadata,
}

impl Drop for BackupEntry {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[derive(Serialize, Deserialize)]
struct BackupBundle {
    version: u8,
    entries: Vec<BackupEntry>,
}

struct CachedKey<I> {
    key: SessionKey,
    cached_at: I,
}

/// Persistent store of session keys.
pub struct KeyVault<S: Storage, P: SecureStore, E: Environment> {
    storage: S,
    secure: P,
    env: E,
    config: VaultConfig,
    cache: Mutex<HashMap<String, CachedKey<E::Instant>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    device_key: Mutex<Option<Zeroizing<[u8; KEY_SIZE]>>>,
}

impl<S: Storage, P: SecureStore, E: Environment> KeyVault<S, P, E> {
    /// Create a vault over the given backends.
    pub fn new(storage: S, secure: P, env: E, config: VaultConfig) -> Self {
        Self {
            storage,
            secure,
            env,
            config,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            device_key: Mutex::new(None),
        }
    }

    /// Vault configuration.
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Ordinary storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Persist a session key and its metadata.
    ///
    /// Returns the path the key took. Overwrites any previous key for the
    /// session, which is how rotation lands.
    ///
    /// # Errors
    ///
    /// - `InvalidSessionId` for an empty id or one containing `/`
    /// - `Storage` if ordinary storage fails (secure-store failures fall back)
    pub fn store_key(
        &self,
        session_id: &str,
        key: &SessionKey,
        info: KeyInfo,
    ) -> Result<StoragePath, VaultError> {
        validate(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let created = self.env.wall_clock_millis();
        let path = self.persist_secret(
            &secure_session_id(session_id),
            &format!("{KEY_PREFIX}{session_id}"),
            &format!("{META_PREFIX}{session_id}"),
            key.as_bytes(),
            |storage| to_cbor(&SessionMetadata::active(info, created, storage)),
        )?;

        self.cache_insert(session_id, key.clone());
        info!(session_id, storage = ?path, "session key stored");
        Ok(path)
    }

    /// Retrieve a session key.
    ///
    /// Served from memory while cached; otherwise read through the path
    /// recorded in metadata. `None` if the session has no key.
    pub fn get_key(&self, session_id: &str) -> Result<Option<SessionKey>, VaultError> {
        validate(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.get_key_locked(session_id)
    }

    /// Remove a session's key, metadata and cache entry.
    pub fn delete_key(&self, session_id: &str) -> Result<(), VaultError> {
        validate(session_id)?;
        let lock = self.session_lock(session_id);
        {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.purge(session_id)?;
        }
        self.release_lock(session_id, &lock);
        info!(session_id, "session key deleted");
        Ok(())
    }

    /// Remove every session and pending handshake.
    ///
    /// The device obfuscation key is kept; it identifies the device, not a
    /// session.
    pub fn clear_all(&self) -> Result<(), VaultError> {
        let sessions = self.list_sessions()?;
        for session_id in &sessions {
            let lock = self.session_lock(session_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.purge(session_id)?;
        }

        for session_id in self.pending_exchanges()? {
            let lock = self.session_lock(&session_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.purge_pending(&session_id)?;
        }

        self.lock_cache().clear();
        info!(sessions = sessions.len(), "vault cleared");
        Ok(())
    }

    /// Whether the session has a retrievable key younger than the max age.
    ///
    /// Invalid sessions are purged as a side effect. Storage errors are
    /// returned rather than treated as invalid, so a flaky backend never
    /// destroys a good key.
    pub fn is_session_valid(&self, session_id: &str) -> Result<bool, VaultError> {
        validate(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(meta) = self.load_metadata(session_id)? else {
            self.purge(session_id)?;
            return Ok(false);
        };

        if self.is_expired(&meta) {
            info!(session_id, age_ms = meta.age_millis(self.env.wall_clock_millis()), "session expired");
            self.purge(session_id)?;
            return Ok(false);
        }

        if self.get_key_locked(session_id)?.is_none() {
            warn!(session_id, "metadata without key material, purging");
            self.purge(session_id)?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Lifecycle status, reporting `Expired` for sessions past the max age.
    pub fn session_status(&self, session_id: &str) -> Result<Option<SessionStatus>, VaultError> {
        Ok(self.metadata(session_id)?.map(|meta| {
            if self.is_expired(&meta) { SessionStatus::Expired } else { meta.status }
        }))
    }

    /// Stored metadata for a session.
    pub fn metadata(&self, session_id: &str) -> Result<Option<SessionMetadata>, VaultError> {
        validate(session_id)?;
        self.load_metadata(session_id)
    }

    /// Ids of every session with metadata, in ascending order.
    pub fn list_sessions(&self) -> Result<Vec<String>, VaultError> {
        Ok(strip_prefix(self.storage.keys_with_prefix(META_PREFIX)?, META_PREFIX))
    }

    /// Persist the ephemeral half of an in-flight handshake.
    ///
    /// Lets a handshake finish after a restart. Uses the same secure-first
    /// policy as session keys.
    pub fn store_pending_exchange(
        &self,
        session_id: &str,
        peer: &str,
        secret: &SecretKey,
        rotation: bool,
    ) -> Result<StoragePath, VaultError> {
        validate(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let created = self.env.wall_clock_millis();
        let path = self.persist_secret(
            &secure_pending_id(session_id),
            &format!("{PENDING_KEY_PREFIX}{session_id}"),
            &format!("{PENDING_PREFIX}{session_id}"),
            secret.as_bytes(),
            |storage| to_cbor(&PendingRecord { peer: peer.to_string(), created, rotation, storage }),
        )?;

        debug!(session_id, peer, storage = ?path, "pending exchange stored");
        Ok(path)
    }

    /// Restore a persisted handshake.
    pub fn load_pending_exchange(
        &self,
        session_id: &str,
    ) -> Result<Option<PendingExchange>, VaultError> {
        validate(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(bytes) = self.storage.get(&format!("{PENDING_PREFIX}{session_id}"))? else {
            return Ok(None);
        };
        let record: PendingRecord = from_cbor(&bytes)?;

        let Some(secret) = self.load_secret(
            record.storage,
            &secure_pending_id(session_id),
            &format!("{PENDING_KEY_PREFIX}{session_id}"),
        )?
        else {
            warn!(session_id, "pending record without secret");
            return Ok(None);
        };

        let secret = SecretKey::from_slice(&secret).map_err(|e| VaultError::CorruptKey {
            session_id: session_id.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Some(PendingExchange {
            peer: record.peer,
            created: record.created,
            rotation: record.rotation,
            key_pair: KeyPair::from_secret(secret),
        }))
    }

    /// Forget a persisted handshake.
    pub fn remove_pending_exchange(&self, session_id: &str) -> Result<(), VaultError> {
        validate(session_id)?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.purge_pending(session_id)
    }

    /// Session ids with a persisted handshake.
    pub fn pending_exchanges(&self) -> Result<Vec<String>, VaultError> {
        Ok(strip_prefix(self.storage.keys_with_prefix(PENDING_PREFIX)?, PENDING_PREFIX))
    }

    /// Seal every session key and its metadata under a key derived from
    /// `identity`.
    ///
    /// Expired sessions are left out. The bundle carries a key commitment, so
    /// importing under the wrong identity fails as `Authentication`.
    pub fn export_backup(&self, identity: &str) -> Result<EncryptedEnvelope, VaultError> {
        let mut entries = Vec::new();
        for session_id in self.list_sessions()? {
            let lock = self.session_lock(&session_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let Some(metadata) = self.load_metadata(&session_id)? else { continue };
            if self.is_expired(&metadata) {
                continue;
            }
            let Some(key) = self.get_key_locked(&session_id)? else { continue };
            entries.push(BackupEntry { session_id, key: key.as_bytes().to_vec(), metadata });
        }

        let count = entries.len();
        let bundle = BackupBundle { version: BACKUP_VERSION, entries };
        let plaintext = Zeroizing::new(to_cbor(&bundle)?);

        let algorithm = Algorithm::XChaCha20Poly1305;
        let mut nonce = vec![0u8; algorithm.nonce_len()];
        self.env.try_random_bytes(&mut nonce).map_err(|e| VaultError::Backup(e.to_string()))?;

        let envelope = seal_envelope(&plaintext, &backup_key(identity), algorithm, &nonce, true)?;
        info!(sessions = count, "backup exported");
        Ok(envelope)
    }

    /// Restore sessions from a bundle produced by [`Self::export_backup`].
    ///
    /// Returns the number of sessions restored. Existing sessions with the
    /// same id are overwritten; their original creation time is kept.
    pub fn import_backup(
        &self,
        identity: &str,
        bundle: &EncryptedEnvelope,
    ) -> Result<usize, VaultError> {
        let plaintext = Zeroizing::new(open_envelope(bundle, &backup_key(identity))?);
        let bundle: BackupBundle = from_cbor(&plaintext)?;
        if bundle.version != BACKUP_VERSION {
            return Err(VaultError::Backup(format!("unsupported bundle version {}", bundle.version)));
        }

        let mut restored = 0;
        for entry in &bundle.entries {
            validate(&entry.session_id)?;
            let key = SessionKey::from_slice(&entry.key).map_err(|e| VaultError::CorruptKey {
                session_id: entry.session_id.clone(),
                reason: e.to_string(),
            })?;

            let lock = self.session_lock(&entry.session_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let metadata = entry.metadata.clone();
            self.persist_secret(
                &secure_session_id(&entry.session_id),
                &format!("{KEY_PREFIX}{}", entry.session_id),
                &format!("{META_PREFIX}{}", entry.session_id),
                key.as_bytes(),
                |storage| to_cbor(&SessionMetadata { storage, ..metadata }),
            )?;
            self.cache_insert(&entry.session_id, key);
            restored += 1;
        }

        info!(sessions = restored, "backup imported");
        Ok(restored)
    }

    fn get_key_locked(&self, session_id: &str) -> Result<Option<SessionKey>, VaultError> {
        if let Some(key) = self.cache_get(session_id) {
            return Ok(Some(key));
        }

        let Some(meta) = self.load_metadata(session_id)? else {
            return Ok(None);
        };

        let Some(secret) = self.load_secret(
            meta.storage,
            &secure_session_id(session_id),
            &format!("{KEY_PREFIX}{session_id}"),
        )?
        else {
            return Ok(None);
        };

        let key = SessionKey::from_slice(&secret).map_err(|e| VaultError::CorruptKey {
            session_id: session_id.to_string(),
            reason: e.to_string(),
        })?;

        self.cache_insert(session_id, key.clone());
        debug!(session_id, storage = ?meta.storage, "session key loaded");
        Ok(Some(key))
    }

    /// Write `secret` secure-first, then the record describing it, in one
    /// storage batch.
    fn persist_secret(
        &self,
        secure_id: &str,
        blob_key: &str,
        record_key: &str,
        secret: &[u8],
        record_for: impl FnOnce(StoragePath) -> Result<Vec<u8>, StorageError>,
    ) -> Result<StoragePath, VaultError> {
        match self.secure.store(secure_id, secret) {
            Ok(()) => {
                let record = record_for(StoragePath::Secure)?;
                let written = self
                    .storage
                    .write_batch(&[WriteOp::put(record_key, record), WriteOp::delete(blob_key)]);
                if let Err(err) = written {
                    self.forget_secure(secure_id);
                    return Err(err.into());
                }
                Ok(StoragePath::Secure)
            },
            Err(err) => {
                warn!(id = secure_id, error = %err, "secure store failed, using obfuscated storage");
                let blob = self.obfuscate(secret)?;
                let record = record_for(StoragePath::Obfuscated)?;
                self.storage.write_batch(&[
                    WriteOp::put(blob_key, blob.to_vec()),
                    WriteOp::put(record_key, record),
                ])?;
                // an earlier secret under this id would otherwise outlive its record
                self.forget_secure(secure_id);
                Ok(StoragePath::Obfuscated)
            },
        }
    }

    fn load_secret(
        &self,
        path: StoragePath,
        secure_id: &str,
        blob_key: &str,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        match path {
            StoragePath::Secure => Ok(self.secure.load(secure_id)?),
            StoragePath::Obfuscated => match self.storage.get(blob_key)? {
                Some(blob) => Ok(Some(self.obfuscate(&blob)?)),
                None => Ok(None),
            },
        }
    }

    fn load_metadata(&self, session_id: &str) -> Result<Option<SessionMetadata>, VaultError> {
        match self.storage.get(&format!("{META_PREFIX}{session_id}"))? {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    fn is_expired(&self, meta: &SessionMetadata) -> bool {
        u128::from(meta.age_millis(self.env.wall_clock_millis()))
            > self.config.max_session_age.as_millis()
    }

    /// Caller holds the session lock.
    fn purge(&self, session_id: &str) -> Result<(), VaultError> {
        self.lock_cache().remove(session_id);
        self.storage.write_batch(&[
            WriteOp::delete(format!("{META_PREFIX}{session_id}")),
            WriteOp::delete(format!("{KEY_PREFIX}{session_id}")),
        ])?;
        self.forget_secure(&secure_session_id(session_id));
        Ok(())
    }

    /// Caller holds the session lock.
    fn purge_pending(&self, session_id: &str) -> Result<(), VaultError> {
        self.storage.write_batch(&[
            WriteOp::delete(format!("{PENDING_PREFIX}{session_id}")),
            WriteOp::delete(format!("{PENDING_KEY_PREFIX}{session_id}")),
        ])?;
        self.forget_secure(&secure_pending_id(session_id));
        Ok(())
    }

    fn forget_secure(&self, secure_id: &str) {
        if let Err(err) = self.secure.remove(secure_id) {
            debug!(id = secure_id, error = %err, "secure store removal failed");
        }
    }

    /// XOR with the device key. Its own inverse.
    fn obfuscate(&self, bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let device = self.device_key()?;
        Ok(Zeroizing::new(bytes.iter().zip(device.iter().cycle()).map(|(b, d)| b ^ d).collect()))
    }

    fn device_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>, VaultError> {
        let mut slot = self.device_key.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = slot.as_ref() {
            return Ok(key.clone());
        }

        let key = match self.storage.get(DEVICE_KEY)? {
            Some(bytes) => {
                let bytes = Zeroizing::new(bytes);
                let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
                    StorageError::Serialization(format!(
                        "device key must be {KEY_SIZE} bytes, got {}",
                        bytes.len()
                    ))
                })?;
                Zeroizing::new(key)
            },
            None => {
                let mut key = Zeroizing::new([0u8; KEY_SIZE]);
                self.env
                    .try_random_bytes(key.as_mut_slice())
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                self.storage.put(DEVICE_KEY, key.as_slice())?;
                info!("device obfuscation key created");
                key
            },
        };

        *slot = Some(key.clone());
        Ok(key)
    }

    fn cache_get(&self, session_id: &str) -> Option<SessionKey> {
        let now = self.env.now();
        let mut cache = self.lock_cache();
        match cache.get(session_id) {
            Some(entry) if now - entry.cached_at < self.config.cache_ttl => Some(entry.key.clone()),
            Some(_) => {
                cache.remove(session_id);
                None
            },
            None => None,
        }
    }

    fn cache_insert(&self, session_id: &str, key: SessionKey) {
        let now = self.env.now();
        let mut cache = self.lock_cache();
        cache.retain(|_, entry| now - entry.cached_at < self.config.cache_ttl);
        cache.insert(session_id.to_string(), CachedKey { key, cached_at: now });
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, CachedKey<E::Instant>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Drop the lock entry if nobody else holds it.
    fn release_lock(&self, session_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(lock) == 2 {
            locks.remove(session_id);
        }
    }
}

impl<S: Storage, P: SecureStore, E: Environment> std::fmt::Debug for KeyVault<S, P, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("config", &self.config)
            .field("cached_keys", &self.lock_cache().len())
            .finish_non_exhaustive()
    }
}

fn validate(session_id: &str) -> Result<(), VaultError> {
    if session_id.is_empty() || session_id.contains('/') {
        return Err(VaultError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

fn secure_session_id(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn secure_pending_id(session_id: &str) -> String {
    format!("pending:{session_id}")
}

fn strip_prefix(keys: Vec<String>, prefix: &str) -> Vec<String> {
    keys.into_iter().filter_map(|key| key.strip_prefix(prefix).map(str::to_string)).collect()
}

fn backup_key(identity: &str) -> SessionKey {
    let hkdf = Hkdf::<Sha256>::new(Some(BACKUP_SALT), identity.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let Ok(()) = hkdf.expand(BACKUP_INFO, key.as_mut_slice()) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    SessionKey::from_bytes(*key)
}
