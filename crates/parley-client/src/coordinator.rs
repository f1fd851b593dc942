//! Session coordinator.
//!
//! Runs the key-exchange handshake for every peer and fronts encryption for
//! the application. Sans-IO like the transport: messages and time go in,
//! [`CoordinatorAction`]s come out, and the caller moves them over the wire.
//!
//! # Handshake
//!
//! ```text
//!  initiator                                   responder
//!  NoSession
//!    start_exchange ── key_exchange(pending) ──▶ NoSession
//!  KeyExchangeInitiated                          derive, store
//!    ◀── key_exchange(ready) + encryption_ready ─ Active
//!  derive, store
//!  Active ── encryption_ready ──────────────────▶
//! ```
//!
//! A `key_exchange` with no public key and status `pending` is the broker
//! saying the peer is offline and the offer is queued (`AwaitingPeer`).
//! Rotation reruns the same exchange from `Active`; the current key keeps
//! working until the new one is stored over it. The replaced key is retired
//! rather than forgotten: inbound messages sealed under it still open until
//! the first one under the new key arrives or the handshake timeout passes.
//!
//! Stored sessions live no longer than the vault's maximum age. Using an
//! expired one fails with [`ClientError::SessionExpired`] and drops the
//! session, so the next [`SessionCoordinator::ensure_session`] renegotiates.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parley_core::{CryptoEngine, Environment};
use parley_crypto::{EncryptedEnvelope, KeyPair, PublicKey, SessionKey};
use parley_proto::{
    ChatMessage, EncryptionReady, ExchangeStatus, KeyExchange, KeyRotationRequired, Message,
};
use parley_vault::{KeyInfo, KeyVault, SecureStore, Storage};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    event::{CoordinatorAction, DecryptedMessage, MessageBody, SessionEvent, SessionState},
};

/// How long a handshake may wait for the peer (2 minutes).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Handshakes with no answer after this long are abandoned
    pub handshake_timeout: Duration,
    /// Attach a key commitment to every outgoing envelope
    pub key_commitment: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT, key_commitment: true }
    }
}

/// Session id both sides of a conversation agree on without negotiating.
pub fn session_id_for(a: &str, b: &str) -> String {
    if a <= b { format!("{a}:{b}") } else { format!("{b}:{a}") }
}

struct PeerSession<I> {
    session_id: String,
    state: SessionState,
    /// Our ephemeral pair while a handshake is in flight
    pending: Option<KeyPair>,
    /// Handshake deadline
    deadline: Option<I>,
    /// Key replaced by the last rotation and when it stops being accepted
    retired: Option<(SessionKey, I)>,
}

impl<I> PeerSession<I> {
    fn active(session_id: String) -> Self {
        Self { session_id, state: SessionState::Active, pending: None, deadline: None, retired: None }
    }
}

/// Per-peer handshake state machine and encryption façade.
pub struct SessionCoordinator<S: Storage, P: SecureStore, E: Environment> {
    identity: String,
    env: E,
    engine: Arc<CryptoEngine<E>>,
    vault: Arc<KeyVault<S, P, E>>,
    config: CoordinatorConfig,
    sessions: HashMap<String, PeerSession<E::Instant>>,
}

impl<S: Storage, P: SecureStore, E: Environment> SessionCoordinator<S, P, E> {
    /// Create a coordinator for `identity`.
    pub fn new(
        identity: impl Into<String>,
        env: E,
        engine: Arc<CryptoEngine<E>>,
        vault: Arc<KeyVault<S, P, E>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self { identity: identity.into(), env, engine, vault, config, sessions: HashMap::new() }
    }

    /// Our identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Coordinator configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The vault sessions are persisted in.
    pub fn vault(&self) -> &Arc<KeyVault<S, P, E>> {
        &self.vault
    }

    /// Handshake state for `peer`.
    pub fn state(&self, peer: &str) -> SessionState {
        self.sessions.get(peer).map_or(SessionState::NoSession, |s| s.state)
    }

    /// Session id in use with `peer`, if any.
    pub fn session_id(&self, peer: &str) -> Option<&str> {
        self.sessions.get(peer).map(|s| s.session_id.as_str())
    }

    /// Peers with a session or handshake, and their states.
    pub fn sessions(&self) -> impl Iterator<Item = (&str, SessionState)> {
        self.sessions.iter().map(|(peer, s)| (peer.as_str(), s.state))
    }

    /// Start a key exchange with `peer`.
    ///
    /// # Errors
    ///
    /// - `InvalidPeer` for an empty peer or ourselves
    /// - `InvalidState` unless the peer is in `NoSession`
    /// - `Crypto` if no key pair could be generated
    /// - `Vault` if the pending exchange could not be persisted
    pub fn start_exchange(
        &mut self,
        peer: &str,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        self.validate_peer(peer)?;
        let state = self.state(peer);
        if state != SessionState::NoSession {
            return Err(ClientError::InvalidState { peer: peer.to_string(), state });
        }

        let session_id = session_id_for(&self.identity, peer);
        self.begin_handshake(peer, session_id, false, now)
    }

    /// Resume a stored session with `peer`, or start a handshake if there is
    /// no valid one. A no-op while a session or handshake already exists.
    pub fn ensure_session(
        &mut self,
        peer: &str,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        self.validate_peer(peer)?;
        if self.state(peer) != SessionState::NoSession || self.resume(peer)? {
            return Ok(Vec::new());
        }

        let session_id = session_id_for(&self.identity, peer);
        self.begin_handshake(peer, session_id, false, now)
    }

    /// Replace the key shared with `peer`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the peer is `Active`
    pub fn rotate(
        &mut self,
        peer: &str,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        let Some(session) = self.sessions.get(peer).filter(|s| s.state == SessionState::Active)
        else {
            return Err(ClientError::InvalidState { peer: peer.to_string(), state: self.state(peer) });
        };

        let session_id = session.session_id.clone();
        self.begin_handshake(peer, session_id, true, now)
    }

    /// Ask `peer` to rotate. The peer runs the exchange; we respond.
    pub fn request_rotation(
        &self,
        peer: &str,
        reason: Option<String>,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        let session_id = self
            .sessions
            .get(peer)
            .filter(|s| s.state == SessionState::Active)
            .map(|s| s.session_id.clone())
            .ok_or_else(|| ClientError::NoSession { peer: peer.to_string() })?;

        Ok(vec![CoordinatorAction::Send(Message::KeyRotationRequired(KeyRotationRequired {
            from: self.identity.clone(),
            to: peer.to_string(),
            session_id,
            reason,
        }))])
    }

    /// Delete every key and pending exchange for `peer`.
    pub fn teardown(&mut self, peer: &str) -> Result<Vec<CoordinatorAction>, ClientError> {
        let session_id = self
            .sessions
            .remove(peer)
            .map_or_else(|| session_id_for(&self.identity, peer), |s| s.session_id);

        self.vault.delete_key(&session_id)?;
        self.vault.remove_pending_exchange(&session_id)?;

        info!(peer, session_id, "session torn down");
        Ok(vec![CoordinatorAction::Emit(SessionEvent::SessionClosed { peer: peer.to_string() })])
    }

    /// Tear down every session, including ones only the vault knows about.
    pub fn teardown_all(&mut self) -> Result<Vec<CoordinatorAction>, ClientError> {
        self.vault.clear_all()?;

        let mut peers: Vec<String> = self.sessions.drain().map(|(peer, _)| peer).collect();
        peers.sort();

        info!(peers = peers.len(), "all sessions torn down");
        Ok(peers
            .into_iter()
            .map(|peer| CoordinatorAction::Emit(SessionEvent::SessionClosed { peer }))
            .collect())
    }

    /// Reload sessions and handshakes that existed when the process stopped.
    ///
    /// Stored sessions still within the maximum age come back `Active`;
    /// expired ones are purged. Handshakes older than the timeout are
    /// discarded and the rest resume with whatever time they had left.
    /// Returns how many peers were restored.
    pub fn restore(&mut self, now: E::Instant) -> Result<usize, ClientError> {
        let wall_ms = self.env.wall_clock_millis();
        let mut restored = 0;

        for session_id in self.vault.list_sessions()? {
            let Some(peer) = self.peer_of(&session_id) else {
                debug!(session_id, "stored session belongs to another identity");
                continue;
            };
            if self.sessions.contains_key(&peer) || !self.vault.is_session_valid(&session_id)? {
                continue;
            }

            info!(peer, session_id, "session restored");
            self.sessions.insert(peer, PeerSession::active(session_id));
            restored += 1;
        }

        for session_id in self.vault.pending_exchanges()? {
            let Some(pending) = self.vault.load_pending_exchange(&session_id)? else {
                continue;
            };

            let age = Duration::from_millis(wall_ms.saturating_sub(pending.created));
            if age >= self.config.handshake_timeout {
                debug!(session_id, ?age, "discarding stale pending exchange");
                self.vault.remove_pending_exchange(&session_id)?;
                continue;
            }

            let state = if pending.rotation && self.vault.is_session_valid(&session_id)? {
                SessionState::Rotating
            } else {
                SessionState::KeyExchangeInitiated
            };

            info!(peer = pending.peer, session_id, ?state, "pending exchange restored");
            let previous = self.sessions.insert(pending.peer, PeerSession {
                session_id,
                state,
                pending: Some(pending.key_pair),
                deadline: Some(now + (self.config.handshake_timeout - age)),
                retired: None,
            });
            if previous.is_none() {
                restored += 1;
            }
        }

        Ok(restored)
    }

    /// Process an inbound message.
    ///
    /// Messages not addressed to us are ignored. Handshake problems caused by
    /// the peer (bad keys, unexpected replies) are logged and leave the state
    /// untouched; only local failures surface as errors.
    pub fn handle_message(
        &mut self,
        message: &Message,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        match message {
            Message::KeyExchange(exchange) => self.handle_key_exchange(exchange, now),
            Message::EncryptionReady(ready) => Ok(self.handle_encryption_ready(ready)),
            Message::KeyRotationRequired(request) => self.handle_rotation_required(request, now),
            Message::Chat(chat) => self.handle_chat(chat, now),
            Message::Ping
            | Message::Pong
            | Message::TypingStatus(_)
            | Message::UserStatus(_)
            | Message::Error(_) => Ok(Vec::new()),
        }
    }

    /// Abandon handshakes whose deadline has passed.
    ///
    /// A timed-out rotation falls back to `Active` on the current key; any
    /// other handshake falls back to `NoSession`.
    pub fn tick(&mut self, now: E::Instant) -> Vec<CoordinatorAction> {
        let mut expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.deadline.is_some_and(|deadline| now >= deadline))
            .map(|(peer, _)| peer.clone())
            .collect();
        expired.sort();

        let mut actions = Vec::new();
        for peer in expired {
            let Some(session) = self.sessions.get_mut(&peer) else { continue };

            let fallback = if session.state == SessionState::Rotating {
                SessionState::Active
            } else {
                SessionState::NoSession
            };
            session.state = fallback;
            session.pending = None;
            session.deadline = None;
            let session_id = session.session_id.clone();

            if fallback == SessionState::NoSession {
                self.sessions.remove(&peer);
            }
            if let Err(e) = self.vault.remove_pending_exchange(&session_id) {
                warn!(peer, error = %e, "failed to remove pending exchange");
            }

            warn!(peer, ?fallback, "handshake timed out");
            actions.push(CoordinatorAction::Emit(SessionEvent::HandshakeTimedOut { peer, fallback }));
        }

        actions
    }

    /// Earliest handshake deadline.
    pub fn next_deadline(&self) -> Option<E::Instant> {
        self.sessions.values().filter_map(|s| s.deadline).min()
    }

    /// Encrypt `plaintext` for `peer` into a ready-to-send chat message.
    ///
    /// # Errors
    ///
    /// - `NoSession` unless the peer is `Active` or `Rotating` with a stored
    ///   key
    /// - `SessionExpired` if the stored key outlived the maximum age; the
    ///   session is dropped and must be renegotiated
    /// - `Crypto` if every cipher failed
    pub fn encrypt(&mut self, peer: &str, plaintext: &[u8]) -> Result<Message, ClientError> {
        let (session_id, key) = self.session_key(peer)?;

        let envelope = if self.config.key_commitment {
            self.engine.encrypt_with_commitment(plaintext, &key)?
        } else {
            self.engine.encrypt(plaintext, &key)?
        };

        Ok(Message::Chat(ChatMessage {
            id: format!("{:032x}", self.env.random_u128()),
            from: self.identity.clone(),
            to: peer.to_string(),
            session_id,
            envelope: envelope.into(),
        }))
    }

    /// Decrypt a chat message from a peer.
    ///
    /// A message that fails to authenticate under the current key is tried
    /// under the retired one, if a rotation left one behind. Failing both, or
    /// carrying an envelope that could not be parsed, it becomes an
    /// `Undecryptable` placeholder; the session is kept.
    ///
    /// # Errors
    ///
    /// - `NoSession` if there is no key for the sender
    /// - `SessionExpired` if the stored key outlived the maximum age
    pub fn decrypt(
        &mut self,
        chat: &ChatMessage,
        now: E::Instant,
    ) -> Result<DecryptedMessage, ClientError> {
        let (session_id, key) = self.session_key(&chat.from)?;
        if chat.session_id != session_id {
            debug!(peer = chat.from, expected = session_id, got = chat.session_id, "session id mismatch");
        }

        let envelope = match chat.envelope.sealed() {
            Ok(envelope) => envelope,
            Err(reason) => {
                warn!(peer = chat.from, id = chat.id, reason, "unreadable envelope");
                return Ok(undecryptable(chat, &reason));
            },
        };

        let body = match self.engine.decrypt(envelope, &key) {
            Ok(plaintext) => {
                // the peer has switched to the new key
                if let Some(session) = self.sessions.get_mut(&chat.from) {
                    session.retired = None;
                }
                MessageBody::Plaintext(plaintext)
            },
            Err(e) => match self.open_with_retired(&chat.from, envelope, now) {
                Some(plaintext) => {
                    debug!(peer = chat.from, id = chat.id, "message opened with retired key");
                    MessageBody::Plaintext(plaintext)
                },
                None => {
                    warn!(peer = chat.from, id = chat.id, error = %e, "message undecryptable");
                    MessageBody::Undecryptable { reason: e.to_string() }
                },
            },
        };

        Ok(DecryptedMessage {
            id: chat.id.clone(),
            from: chat.from.clone(),
            session_id: chat.session_id.clone(),
            body,
        })
    }

    fn handle_key_exchange(
        &mut self,
        exchange: &KeyExchange,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        if exchange.to != self.identity || exchange.from == self.identity {
            debug!(from = exchange.from, to = exchange.to, "key exchange not for us");
            return Ok(Vec::new());
        }
        let peer = exchange.from.as_str();
        self.adopt_stored(peer);
        let state = self.state(peer);

        if exchange.public_key.is_empty() {
            if exchange.status == ExchangeStatus::Pending
                && state == SessionState::KeyExchangeInitiated
            {
                if let Some(session) = self.sessions.get_mut(peer) {
                    session.state = SessionState::AwaitingPeer;
                }
                info!(peer, "peer offline, offer queued");
            }
            return Ok(Vec::new());
        }

        let peer_public = match PublicKey::from_base64(&exchange.public_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(peer, error = %e, "unusable peer public key");
                return Ok(Vec::new());
            },
        };

        match state {
            SessionState::KeyExchangeInitiated
            | SessionState::AwaitingPeer
            | SessionState::Rotating => self.complete_handshake(peer, &peer_public, now),
            SessionState::NoSession | SessionState::Active => {
                if exchange.status == ExchangeStatus::Ready {
                    debug!(peer, ?state, "unsolicited key exchange reply");
                    return Ok(Vec::new());
                }
                self.respond_to_offer(peer, exchange, &peer_public, now)
            },
        }
    }

    /// We initiated; the peer's key arrived.
    fn complete_handshake(
        &mut self,
        peer: &str,
        peer_public: &PublicKey,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        let Some(session) = self.sessions.get(peer) else {
            return Ok(Vec::new());
        };
        let Some(pair) = session.pending.as_ref() else {
            return Ok(Vec::new());
        };
        let session_id = session.session_id.clone();
        let local_public = *pair.public();

        let key = match self
            .engine
            .derive_shared_secret(pair.secret().as_bytes(), peer_public.as_bytes())
        {
            Ok(key) => key,
            Err(e) => {
                warn!(peer, error = %e, "key derivation failed, waiting for next signal");
                return Ok(Vec::new());
            },
        };

        let retired = self.retire_current(peer, now)?;
        self.vault.store_key(&session_id, &key, self.key_info())?;
        self.vault.remove_pending_exchange(&session_id)?;
        self.sessions.insert(peer.to_string(), PeerSession {
            retired,
            ..PeerSession::active(session_id.clone())
        });

        Ok(self.agreed(peer, &session_id, &local_public, peer_public))
    }

    /// The peer initiated (or is rotating); answer with our own key.
    fn respond_to_offer(
        &mut self,
        peer: &str,
        offer: &KeyExchange,
        peer_public: &PublicKey,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        let session_id = if offer.session_id.is_empty() {
            session_id_for(&self.identity, peer)
        } else {
            offer.session_id.clone()
        };

        let pair = self.engine.generate_key_pair()?;
        let key = match self
            .engine
            .derive_shared_secret(pair.secret().as_bytes(), peer_public.as_bytes())
        {
            Ok(key) => key,
            Err(e) => {
                warn!(peer, error = %e, "key derivation failed, ignoring offer");
                return Ok(Vec::new());
            },
        };

        let retired = self.retire_current(peer, now)?;
        self.vault.store_key(&session_id, &key, self.key_info())?;
        self.sessions.insert(peer.to_string(), PeerSession {
            retired,
            ..PeerSession::active(session_id.clone())
        });

        let reply =
            self.key_exchange_message(peer, &session_id, &pair, ExchangeStatus::Ready, offer.rotation);
        let mut actions = vec![CoordinatorAction::Send(reply)];
        actions.extend(self.agreed(peer, &session_id, pair.public(), peer_public));
        Ok(actions)
    }

    fn handle_encryption_ready(&self, ready: &EncryptionReady) -> Vec<CoordinatorAction> {
        if ready.to != self.identity {
            return Vec::new();
        }
        if !self.state(&ready.from).has_key() {
            debug!(peer = ready.from, "encryption_ready without a session");
            return Vec::new();
        }
        debug!(peer = ready.from, "peer confirmed session");
        vec![CoordinatorAction::Emit(SessionEvent::PeerConfirmed { peer: ready.from.clone() })]
    }

    fn handle_rotation_required(
        &mut self,
        request: &KeyRotationRequired,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        if request.to != self.identity {
            return Ok(Vec::new());
        }
        if self.state(&request.from) != SessionState::Active {
            debug!(peer = request.from, state = ?self.state(&request.from), "rotation request ignored");
            return Ok(Vec::new());
        }
        info!(peer = request.from, reason = ?request.reason, "peer requested rotation");
        self.rotate(&request.from, now)
    }

    fn handle_chat(
        &mut self,
        chat: &ChatMessage,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        if chat.to != self.identity {
            return Ok(Vec::new());
        }

        let peer = chat.from.as_str();
        self.adopt_stored(peer);

        let mut renegotiate = Vec::new();
        let message = match self.decrypt(chat, now) {
            Ok(message) => message,
            Err(ClientError::SessionExpired { .. }) => {
                renegotiate = self.ensure_session(peer, now)?;
                undecryptable(chat, "session expired")
            },
            Err(ClientError::NoSession { .. }) => {
                warn!(peer, id = chat.id, "message from peer without a session");
                undecryptable(chat, "no session key")
            },
            Err(e) => return Err(e),
        };

        let mut actions = vec![CoordinatorAction::Emit(SessionEvent::MessageReceived(message))];
        actions.extend(renegotiate);
        Ok(actions)
    }

    fn begin_handshake(
        &mut self,
        peer: &str,
        session_id: String,
        rotation: bool,
        now: E::Instant,
    ) -> Result<Vec<CoordinatorAction>, ClientError> {
        let pair = self.engine.generate_key_pair()?;
        self.vault.store_pending_exchange(&session_id, peer, pair.secret(), rotation)?;

        let offer =
            self.key_exchange_message(peer, &session_id, &pair, ExchangeStatus::Pending, rotation);
        let state =
            if rotation { SessionState::Rotating } else { SessionState::KeyExchangeInitiated };

        info!(peer, session_id, rotation, "key exchange started");
        self.sessions.insert(peer.to_string(), PeerSession {
            session_id,
            state,
            pending: Some(pair),
            deadline: Some(now + self.config.handshake_timeout),
            retired: None,
        });

        let mut actions = vec![CoordinatorAction::Send(offer)];
        if rotation {
            actions.push(CoordinatorAction::Emit(SessionEvent::RotationStarted {
                peer: peer.to_string(),
            }));
        }
        Ok(actions)
    }

    fn agreed(
        &self,
        peer: &str,
        session_id: &str,
        local_public: &PublicKey,
        peer_public: &PublicKey,
    ) -> Vec<CoordinatorAction> {
        info!(peer, session_id, "session key agreed");
        vec![
            CoordinatorAction::Send(Message::EncryptionReady(EncryptionReady {
                from: self.identity.clone(),
                to: peer.to_string(),
                session_id: session_id.to_string(),
            })),
            CoordinatorAction::Emit(SessionEvent::EncryptionReady {
                peer: peer.to_string(),
                session_id: session_id.to_string(),
                fingerprint: self.engine.generate_fingerprint(peer_public),
                local_fingerprint: self.engine.generate_fingerprint(local_public),
            }),
        ]
    }

    fn key_exchange_message(
        &self,
        peer: &str,
        session_id: &str,
        pair: &KeyPair,
        status: ExchangeStatus,
        rotation: bool,
    ) -> Message {
        Message::KeyExchange(KeyExchange {
            from: self.identity.clone(),
            to: peer.to_string(),
            session_id: session_id.to_string(),
            public_key: pair.public().to_base64(),
            status,
            rotation,
        })
    }

    fn keyed_session(&self, peer: &str) -> Result<String, ClientError> {
        self.sessions
            .get(peer)
            .filter(|s| s.state.has_key())
            .map(|s| s.session_id.clone())
            .ok_or_else(|| ClientError::NoSession { peer: peer.to_string() })
    }

    /// Current key for `peer`, provided the stored session is still valid.
    fn session_key(&mut self, peer: &str) -> Result<(String, SessionKey), ClientError> {
        let session_id = self.keyed_session(peer)?;
        if !self.vault.is_session_valid(&session_id)? {
            self.expire(peer);
            return Err(ClientError::SessionExpired { peer: peer.to_string() });
        }

        let key = self
            .vault
            .get_key(&session_id)?
            .ok_or_else(|| ClientError::NoSession { peer: peer.to_string() })?;
        Ok((session_id, key))
    }

    /// The stored key is gone. A rotation in flight carries on as a plain
    /// handshake; anything else drops back to `NoSession`.
    fn expire(&mut self, peer: &str) {
        let Some(session) = self.sessions.get_mut(peer) else { return };
        info!(peer, session_id = session.session_id, "session expired");

        if session.state == SessionState::Rotating {
            session.state = SessionState::KeyExchangeInitiated;
            session.retired = None;
        } else {
            self.sessions.remove(peer);
        }
    }

    /// Adopt a valid stored session with `peer`. Caller checked there is no
    /// session in memory.
    fn resume(&mut self, peer: &str) -> Result<bool, ClientError> {
        let session_id = session_id_for(&self.identity, peer);
        if !self.vault.is_session_valid(&session_id)? {
            return Ok(false);
        }

        info!(peer, session_id, "session resumed from vault");
        self.sessions.insert(peer.to_string(), PeerSession::active(session_id));
        Ok(true)
    }

    /// Pick up a stored session for a peer we hold nothing for in memory.
    fn adopt_stored(&mut self, peer: &str) {
        if self.state(peer) != SessionState::NoSession || self.validate_peer(peer).is_err() {
            return;
        }
        if let Err(e) = self.resume(peer) {
            warn!(peer, error = %e, "stored session lookup failed");
        }
    }

    /// Key currently shared with `peer`, kept for one handshake timeout so
    /// messages the peer sealed before switching still open.
    fn retire_current(
        &self,
        peer: &str,
        now: E::Instant,
    ) -> Result<Option<(SessionKey, E::Instant)>, ClientError> {
        let Some(session) = self.sessions.get(peer).filter(|s| s.state.has_key()) else {
            return Ok(None);
        };
        if !self.vault.is_session_valid(&session.session_id)? {
            return Ok(None);
        }
        let key = self.vault.get_key(&session.session_id)?;
        Ok(key.map(|key| (key, now + self.config.handshake_timeout)))
    }

    fn open_with_retired(
        &mut self,
        peer: &str,
        envelope: &EncryptedEnvelope,
        now: E::Instant,
    ) -> Option<Vec<u8>> {
        let session = self.sessions.get_mut(peer)?;
        let (key, until) = session.retired.as_ref()?;
        if now >= *until {
            session.retired = None;
            return None;
        }
        self.engine.decrypt(envelope, key).ok()
    }

    /// Peer on the other end of a session id, if the id is one of ours.
    fn peer_of(&self, session_id: &str) -> Option<String> {
        let identity = self.identity.as_str();
        let peer = session_id
            .strip_prefix(identity)
            .and_then(|rest| rest.strip_prefix(':'))
            .or_else(|| session_id.strip_suffix(identity).and_then(|rest| rest.strip_suffix(':')))?;

        let ours = self.validate_peer(peer).is_ok() && session_id_for(identity, peer) == session_id;
        ours.then(|| peer.to_string())
    }

    fn key_info(&self) -> KeyInfo {
        KeyInfo {
            algorithm: self.engine.config().preferred,
            has_commitment: self.config.key_commitment,
        }
    }

    fn validate_peer(&self, peer: &str) -> Result<(), ClientError> {
        if peer.is_empty() || peer == self.identity {
            return Err(ClientError::InvalidPeer(peer.to_string()));
        }
        Ok(())
    }
}

fn undecryptable(chat: &ChatMessage, reason: &str) -> DecryptedMessage {
    DecryptedMessage {
        id: chat.id.clone(),
        from: chat.from.clone(),
        session_id: chat.session_id.clone(),
        body: MessageBody::Undecryptable { reason: reason.to_string() },
    }
}

impl<S: Storage, P: SecureStore, E: Environment> std::fmt::Debug for SessionCoordinator<S, P, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("identity", &self.identity)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
