//! Realtime transport state machine.
//!
//! Owns the connection lifecycle, keepalive, reconnection backoff and the
//! offline queue for one identity. Uses the action pattern: methods take the
//! current time and return actions for the driver to execute. No sockets, no
//! timers; the driver sleeps until [`Transport::next_deadline`] and calls
//! [`Transport::tick`].
//!
//! # State Machine
//!
//! ```text
//!                 connect              opened
//! ┌──────────────┐───────>┌────────────┐──────>┌───────────┐
//! │ Disconnected │        │ Connecting │       │ Connected │
//! └──────────────┘<───────└────────────┘<──────└───────────┘
//!        ^   auth rejected /     ^   abnormal drop    │
//!        │   budget exhausted    └────────────────────┤
//!        │                                            │ disconnect
//!        │              closed       ┌─────────┐      │
//!        └───────────────────────────│ Closing │<─────┘
//!                                    └─────────┘
//! ```
//!
//! # Invariants
//!
//! - Queued frames reach the wire in enqueue order, before any frame sent
//!   after the connection opened
//! - Reconnect delays are `min(base × 2^(attempt−1), cap)` and at most
//!   `max_reconnect_attempts` retries are scheduled per outage
//! - The attempt counter resets whenever the credential changes

use std::{
    collections::VecDeque,
    ops::{Add, Sub},
    time::Duration,
};

use parley_proto::{Decoded, Message, MessageKind, WireEnvelope, decode_frame};
use tracing::{debug, error, info, warn};

use crate::{bus::BusEvent, error::TransportError};

/// Normal websocket closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used by the server for a rejected or expired credential.
pub const AUTH_REJECTED: u16 = 4001;

/// Close code used by the server when the identity is not allowed.
pub const AUTH_FORBIDDEN: u16 = 4003;

/// Interval between keepalive pings while connected.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// First reconnect delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on any reconnect delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Reconnect attempts per outage before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Frames held while offline.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Time allowed for a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a close code means the credential was refused.
pub fn is_auth_rejection(code: u16) -> bool {
    matches!(code, AUTH_REJECTED | AUTH_FORBIDDEN)
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Websocket endpoint without identity, e.g. `wss://host/ws`
    pub base_url: String,
    /// Keepalive interval
    pub keepalive_interval: Duration,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Maximum reconnect delay
    pub backoff_cap: Duration,
    /// Retries per outage
    pub max_reconnect_attempts: u32,
    /// Offline queue capacity
    pub queue_capacity: usize,
    /// Connect timeout, enforced by the driver
    pub connect_timeout: Duration,
    /// Frames whose JSON exceeds this many bytes are sent gzip-compressed
    pub compress_threshold: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8080/ws".to_string(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            compress_threshold: None,
        }
    }
}

impl TransportConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exponent).min(self.backoff_cap)
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, nothing scheduled
    Disconnected,
    /// Socket opening, or waiting for a scheduled reconnect
    Connecting,
    /// Socket open
    Connected,
    /// Local close requested, waiting for the socket to finish
    Closing,
}

/// Why a connect attempt failed before the socket opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Upgrade refused with 401/403
    Unauthorized,
    /// Network error or timeout
    Network(String),
}

/// Events surfaced to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket opened
    Connected,
    /// Socket closed and no reconnect follows
    Disconnected {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
    /// Reconnect scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Credential rejected; the stored credential was cleared
    AuthExpired,
    /// Reconnect budget exhausted
    ConnectionLost {
        /// Attempts made
        attempts: u32,
    },
    /// Inbound message (keepalive traffic excluded)
    Message(Message),
    /// Inbound message with an unrecognized type tag
    Unknown {
        /// The unrecognized tag
        kind: String,
    },
}

/// Discriminant of [`TransportEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    /// [`TransportEvent::Connected`]
    Connected,
    /// [`TransportEvent::Disconnected`]
    Disconnected,
    /// [`TransportEvent::Reconnecting`]
    Reconnecting,
    /// [`TransportEvent::AuthExpired`]
    AuthExpired,
    /// [`TransportEvent::ConnectionLost`]
    ConnectionLost,
    /// [`TransportEvent::Message`] of one message type
    Message(MessageKind),
    /// [`TransportEvent::Unknown`]
    Unknown,
}

impl BusEvent for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            Self::Connected => TransportEventKind::Connected,
            Self::Disconnected { .. } => TransportEventKind::Disconnected,
            Self::Reconnecting { .. } => TransportEventKind::Reconnecting,
            Self::AuthExpired => TransportEventKind::AuthExpired,
            Self::ConnectionLost { .. } => TransportEventKind::ConnectionLost,
            Self::Message(message) => TransportEventKind::Message(message.kind()),
            Self::Unknown { .. } => TransportEventKind::Unknown,
        }
    }
}

/// Actions returned by the transport state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportAction {
    /// Open a websocket to this URL
    Open {
        /// Full connection URL including identity and credential
        url: String,
    },
    /// Send this text frame
    Send(String),
    /// Close the socket
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
    /// Deliver an event to subscribers
    Emit(TransportEvent),
}

/// Realtime transport state machine
///
/// Generic over `Instant` so tests can drive virtual time.
#[derive(Debug, Clone)]
pub struct Transport<I> {
    config: TransportConfig,
    state: ConnectionState,
    identity: Option<String>,
    credential: Option<String>,
    /// Reconnect attempts in the current outage
    attempts: u32,
    reconnect_at: Option<I>,
    keepalive_at: Option<I>,
    queue: VecDeque<String>,
    /// Instant paired with `epoch_millis` for wire timestamps
    epoch: I,
    epoch_millis: u64,
}

impl<I> Transport<I>
where
    I: Copy + Ord + Sub<Output = Duration> + Add<Duration, Output = I>,
{
    /// Create a disconnected transport.
    ///
    /// `now` and `wall_clock_millis` anchor the wire timestamps of outgoing
    /// frames.
    pub fn new(config: TransportConfig, now: I, wall_clock_millis: u64) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            identity: None,
            credential: None,
            attempts: 0,
            reconnect_at: None,
            keepalive_at: None,
            queue: VecDeque::new(),
            epoch: now,
            epoch_millis: wall_clock_millis,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identity of the current (or last) connection.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Whether a credential is stored.
    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// Reconnect attempts made in the current outage.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    /// Frames waiting for a connection.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Store the bearer credential used in the connection URL.
    ///
    /// A changed credential resets the reconnect budget.
    pub fn set_credential(&mut self, credential: impl Into<String>) {
        let credential = credential.into();
        if self.credential.as_deref() != Some(credential.as_str()) {
            debug!("credential changed, reconnect budget reset");
            self.attempts = 0;
        }
        self.credential = Some(credential);
    }

    /// Start connecting `identity`.
    ///
    /// No-op while already connecting or connected for the same identity.
    /// Connecting a different identity closes the current socket first.
    ///
    /// # Errors
    ///
    /// - `Connection` if the identity is empty or no credential is stored
    pub fn connect(&mut self, identity: &str) -> Result<Vec<TransportAction>, TransportError> {
        if identity.is_empty() {
            return Err(TransportError::Connection { reason: "identity is empty".to_string() });
        }
        if self.credential.is_none() {
            return Err(TransportError::Connection { reason: "no credential".to_string() });
        }

        let same_identity = self.identity.as_deref() == Some(identity);
        let mut actions = Vec::new();

        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected if same_identity => {
                debug!(identity, "connect ignored, already active");
                return Ok(actions);
            },
            ConnectionState::Connecting | ConnectionState::Connected => {
                info!(from = ?self.identity, to = identity, "switching identity");
                self.queue.clear();
                actions.push(TransportAction::Close {
                    code: NORMAL_CLOSURE,
                    reason: "switching identity".to_string(),
                });
            },
            ConnectionState::Disconnected | ConnectionState::Closing => {},
        }

        self.identity = Some(identity.to_string());
        self.state = ConnectionState::Connecting;
        self.reconnect_at = None;
        self.keepalive_at = None;

        info!(identity, "connecting");
        actions.push(TransportAction::Open { url: self.url(identity) });
        Ok(actions)
    }

    /// Socket opened: flush the offline queue and start keepalive.
    pub fn handle_opened(&mut self, now: I) -> Vec<TransportAction> {
        if self.state != ConnectionState::Connecting {
            debug!(state = ?self.state, "ignoring open in unexpected state");
            return Vec::new();
        }

        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.reconnect_at = None;
        self.keepalive_at = Some(now + self.config.keepalive_interval);

        info!(identity = ?self.identity, queued = self.queue.len(), "connected");

        let mut actions = vec![TransportAction::Emit(TransportEvent::Connected)];
        actions.extend(self.queue.drain(..).map(TransportAction::Send));
        actions
    }

    /// Connect attempt failed before the socket opened.
    pub fn handle_connect_failed(&mut self, failure: ConnectFailure, now: I) -> Vec<TransportAction> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }

        match failure {
            ConnectFailure::Unauthorized => self.auth_rejected(),
            ConnectFailure::Network(reason) => {
                warn!(%reason, "connect attempt failed");
                self.schedule_reconnect(now)
            },
        }
    }

    /// Socket closed by either side.
    pub fn handle_closed(&mut self, code: u16, reason: &str, now: I) -> Vec<TransportAction> {
        self.keepalive_at = None;

        match self.state {
            ConnectionState::Disconnected => Vec::new(),
            ConnectionState::Closing => {
                self.state = ConnectionState::Disconnected;
                info!(code, "disconnected");
                vec![TransportAction::Emit(TransportEvent::Disconnected {
                    code,
                    reason: reason.to_string(),
                })]
            },
            ConnectionState::Connecting | ConnectionState::Connected => {
                if is_auth_rejection(code) {
                    return self.auth_rejected();
                }
                if code == NORMAL_CLOSURE {
                    self.state = ConnectionState::Disconnected;
                    self.reconnect_at = None;
                    info!(code, reason, "server closed connection");
                    return vec![TransportAction::Emit(TransportEvent::Disconnected {
                        code,
                        reason: reason.to_string(),
                    })];
                }

                warn!(code, reason, "connection dropped");
                self.schedule_reconnect(now)
            },
        }
    }

    /// Fire due deadlines: reconnect attempts and keepalive pings.
    pub fn tick(&mut self, now: I) -> Vec<TransportAction> {
        let mut actions = Vec::new();

        if let Some(at) = self.reconnect_at {
            if now >= at && self.state == ConnectionState::Connecting {
                self.reconnect_at = None;
                if let Some(identity) = self.identity.clone() {
                    debug!(attempt = self.attempts, "reconnecting");
                    actions.push(TransportAction::Open { url: self.url(&identity) });
                }
            }
        }

        if let Some(at) = self.keepalive_at {
            if now >= at && self.state == ConnectionState::Connected {
                self.keepalive_at = Some(now + self.config.keepalive_interval);
                match WireEnvelope::new(&Message::Ping, self.timestamp(now)).and_then(|f| f.to_text()) {
                    Ok(text) => actions.push(TransportAction::Send(text)),
                    Err(e) => error!(error = %e, "failed to encode keepalive"),
                }
            }
        }

        actions
    }

    /// Send a message, queueing it while not connected.
    ///
    /// # Errors
    ///
    /// - `QueueFull` if offline and the queue is at capacity
    /// - `Protocol` if the message cannot be encoded
    pub fn send(&mut self, message: &Message, now: I) -> Result<Vec<TransportAction>, TransportError> {
        let text = self.encode(message, now)?;

        if self.state == ConnectionState::Connected {
            return Ok(vec![TransportAction::Send(text)]);
        }

        if self.queue.len() >= self.config.queue_capacity {
            warn!(capacity = self.config.queue_capacity, "offline queue full");
            return Err(TransportError::QueueFull { capacity: self.config.queue_capacity });
        }

        self.queue.push_back(text);
        debug!(queued = self.queue.len(), kind = message.type_tag(), "queued while offline");
        Ok(Vec::new())
    }

    /// Process an inbound text frame.
    ///
    /// Pings are answered immediately. Frames that fail to decode, including
    /// compressed frames that cannot be inflated, are logged and skipped.
    pub fn handle_text(&mut self, text: &str, now: I) -> Vec<TransportAction> {
        let decoded = match decode_frame(text) {
            Ok((_, decoded)) => decoded,
            Err(e) => {
                warn!(error = %e, "skipping undecodable frame");
                return Vec::new();
            },
        };

        match decoded {
            Decoded::Known(Message::Ping) => {
                match WireEnvelope::new(&Message::Pong, self.timestamp(now)).and_then(|f| f.to_text()) {
                    Ok(text) => vec![TransportAction::Send(text)],
                    Err(e) => {
                        error!(error = %e, "failed to encode pong");
                        Vec::new()
                    },
                }
            },
            Decoded::Known(Message::Pong) => Vec::new(),
            Decoded::Known(message) => vec![TransportAction::Emit(TransportEvent::Message(message))],
            Decoded::Unknown { kind, .. } => {
                warn!(%kind, "unknown message type");
                vec![TransportAction::Emit(TransportEvent::Unknown { kind })]
            },
        }
    }

    /// Close with normal closure, drop queued frames and cancel deadlines.
    pub fn disconnect(&mut self) -> Vec<TransportAction> {
        self.reconnect_at = None;
        self.keepalive_at = None;
        self.attempts = 0;
        let dropped = self.queue.len();
        self.queue.clear();

        match self.state {
            ConnectionState::Disconnected | ConnectionState::Closing => Vec::new(),
            ConnectionState::Connecting | ConnectionState::Connected => {
                info!(dropped, "disconnecting");
                self.state = ConnectionState::Closing;
                vec![TransportAction::Close {
                    code: NORMAL_CLOSURE,
                    reason: "client disconnect".to_string(),
                }]
            },
        }
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<I> {
        match (self.reconnect_at, self.keepalive_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn auth_rejected(&mut self) -> Vec<TransportAction> {
        warn!(identity = ?self.identity, "credential rejected");
        self.credential = None;
        self.state = ConnectionState::Disconnected;
        self.reconnect_at = None;
        self.keepalive_at = None;
        self.attempts = 0;
        vec![TransportAction::Emit(TransportEvent::AuthExpired)]
    }

    fn schedule_reconnect(&mut self, now: I) -> Vec<TransportAction> {
        if self.attempts >= self.config.max_reconnect_attempts {
            error!(attempts = self.attempts, "reconnect budget exhausted");
            let attempts = self.attempts;
            self.state = ConnectionState::Disconnected;
            self.reconnect_at = None;
            self.attempts = 0;
            return vec![TransportAction::Emit(TransportEvent::ConnectionLost { attempts })];
        }

        self.attempts += 1;
        let delay = self.config.backoff_delay(self.attempts);
        self.state = ConnectionState::Connecting;
        self.reconnect_at = Some(now + delay);

        info!(attempt = self.attempts, ?delay, "reconnect scheduled");
        vec![TransportAction::Emit(TransportEvent::Reconnecting { attempt: self.attempts, delay })]
    }

    fn url(&self, identity: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let credential = self.credential.as_deref().unwrap_or_default();
        format!("{base}/{identity}?token={credential}")
    }

    fn timestamp(&self, now: I) -> u64 {
        let elapsed = if now >= self.epoch { now - self.epoch } else { Duration::ZERO };
        self.epoch_millis.saturating_add(elapsed.as_millis() as u64)
    }

    fn encode(&self, message: &Message, now: I) -> Result<String, TransportError> {
        let timestamp = self.timestamp(now);
        let plain = WireEnvelope::new(message, timestamp)?.to_text()?;

        match self.config.compress_threshold {
            Some(threshold) if plain.len() > threshold => {
                Ok(WireEnvelope::compressed(message, timestamp)?.to_text()?)
            },
            _ => Ok(plain),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods, reason = "Instant::now only anchors virtual time")]
mod tests {
    use std::time::Instant;

    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use parley_proto::{ChatPayload, Presence, TypingStatus, UserStatus};

    use super::*;
    use crate::bus::EventBus;

    fn config() -> TransportConfig {
        TransportConfig { base_url: "wss://chat.example/ws/".to_string(), ..TransportConfig::default() }
    }

    fn transport(t0: Instant) -> Transport<Instant> {
        let mut transport = Transport::new(config(), t0, 1_700_000_000_000);
        transport.set_credential("token-1");
        transport
    }

    fn typing(n: u32) -> Message {
        Message::TypingStatus(TypingStatus {
            from: "alice".into(),
            to: format!("peer-{n}"),
            is_typing: true,
        })
    }

    fn sent_texts(actions: &[TransportAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                TransportAction::Send(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn connected(t0: Instant) -> Transport<Instant> {
        let mut transport = transport(t0);
        transport.connect("alice").unwrap();
        transport.handle_opened(t0);
        transport
    }

    #[test]
    fn connect_builds_url_with_identity_and_token() {
        let t0 = Instant::now();
        let mut transport = transport(t0);

        let actions = transport.connect("alice").unwrap();

        assert_eq!(transport.state(), ConnectionState::Connecting);
        assert_eq!(actions, vec![TransportAction::Open {
            url: "wss://chat.example/ws/alice?token=token-1".to_string()
        }]);
    }

    #[test]
    fn connect_is_single_flight() {
        let t0 = Instant::now();
        let mut transport = transport(t0);

        transport.connect("alice").unwrap();
        assert!(transport.connect("alice").unwrap().is_empty());

        transport.handle_opened(t0);
        assert!(transport.connect("alice").unwrap().is_empty());
    }

    #[test]
    fn connect_rejects_empty_identity() {
        let t0 = Instant::now();
        let mut transport = transport(t0);

        let result = transport.connect("");
        assert!(matches!(result, Err(TransportError::Connection { .. })));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_requires_credential() {
        let t0 = Instant::now();
        let mut transport = Transport::new(config(), t0, 0);

        assert!(matches!(transport.connect("alice"), Err(TransportError::Connection { .. })));
    }

    #[test]
    fn switching_identity_closes_first() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions = transport.connect("bob").unwrap();

        assert!(matches!(actions[0], TransportAction::Close { code: NORMAL_CLOSURE, .. }));
        assert!(matches!(&actions[1], TransportAction::Open { url } if url.contains("/bob?")));
        assert_eq!(transport.identity(), Some("bob"));
    }

    #[test]
    fn queue_flushes_in_order_on_open() {
        let t0 = Instant::now();
        let mut transport = transport(t0);

        for n in 0..3 {
            assert!(transport.send(&typing(n), t0).unwrap().is_empty());
        }
        assert_eq!(transport.queued(), 3);

        transport.connect("alice").unwrap();
        let actions = transport.handle_opened(t0);

        assert_eq!(actions[0], TransportAction::Emit(TransportEvent::Connected));
        let texts = sent_texts(&actions);
        assert_eq!(texts.len(), 3);
        for (n, text) in texts.iter().enumerate() {
            assert!(text.contains(&format!("peer-{n}")), "frame {n} out of order: {text}");
        }
        assert_eq!(transport.queued(), 0);
    }

    #[test]
    fn queue_rejects_past_capacity() {
        let t0 = Instant::now();
        let mut transport = Transport::new(
            TransportConfig { queue_capacity: 2, ..config() },
            t0,
            0,
        );

        transport.send(&typing(0), t0).unwrap();
        transport.send(&typing(1), t0).unwrap();
        let result = transport.send(&typing(2), t0);

        assert_eq!(result, Err(TransportError::QueueFull { capacity: 2 }));
        assert_eq!(transport.queued(), 2);
    }

    #[test]
    fn send_while_connected_goes_straight_out() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions = transport.send(&typing(7), t0 + Duration::from_millis(250)).unwrap();
        let texts = sent_texts(&actions);

        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains(r#""timestamp":1700000000250"#));
        assert_eq!(transport.queued(), 0);
    }

    #[test]
    fn large_frames_are_compressed_past_threshold() {
        let t0 = Instant::now();
        let mut transport = Transport::new(
            TransportConfig { compress_threshold: Some(16), ..config() },
            t0,
            0,
        );
        transport.set_credential("t");
        transport.connect("alice").unwrap();
        transport.handle_opened(t0);

        let actions = transport.send(&typing(1), t0).unwrap();
        let texts = sent_texts(&actions);

        let (frame, decoded) = decode_frame(texts[0]).unwrap();
        assert!(frame.compressed);
        assert_eq!(decoded, Decoded::Known(typing(1)));
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions = transport.handle_text(r#"{"compressed":false,"timestamp":1,"data":{"type":"ping"}}"#, t0);

        let texts = sent_texts(&actions);
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains(r#""type":"pong""#));
    }

    #[test]
    fn inbound_messages_are_emitted() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions = transport.handle_text(
            r#"{"compressed":false,"timestamp":1,"data":{"type":"user_status","userId":"bob","status":"online"}}"#,
            t0,
        );

        assert_eq!(actions, vec![TransportAction::Emit(TransportEvent::Message(Message::UserStatus(
            UserStatus { user_id: "bob".into(), status: Presence::Online, last_seen: None }
        )))]);
    }

    #[test]
    fn chat_with_unsupported_cipher_is_still_emitted() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions = transport.handle_text(
            r#"{"compressed":false,"timestamp":1,"data":{"type":"message","id":"m1","from":"bob","to":"alice","sessionId":"alice:bob","envelope":{"iv":"AAAAAAAAAAAAAAAA","content":"AQ==","tag":"AgICAgICAgICAgICAgICAg==","algorithm":"AES-128-CBC"}}}"#,
            t0,
        );

        let [TransportAction::Emit(TransportEvent::Message(Message::Chat(chat)))] = actions.as_slice() else {
            panic!("expected the chat to be emitted, got {actions:?}");
        };
        assert_eq!(chat.id, "m1");
        assert!(matches!(chat.envelope, ChatPayload::Unreadable(_)));
    }

    #[test]
    fn bus_routes_messages_by_type() {
        let mut bus = EventBus::new();
        let chats = Arc::new(AtomicUsize::new(0));
        let typing_events = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&chats);
        bus.subscribe(TransportEventKind::Message(MessageKind::Chat), move |_: &TransportEvent| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let count = Arc::clone(&typing_events);
        bus.subscribe(TransportEventKind::Message(MessageKind::TypingStatus), move |_: &TransportEvent| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.dispatch(&TransportEvent::Message(typing(1)));
        bus.dispatch(&TransportEvent::Message(typing(2)));
        let report = bus.dispatch(&TransportEvent::Message(Message::UserStatus(UserStatus {
            user_id: "bob".into(),
            status: Presence::Away,
            last_seen: None,
        })));

        assert_eq!(typing_events.load(Ordering::SeqCst), 2);
        assert_eq!(chats.load(Ordering::SeqCst), 0);
        assert_eq!(report.delivered, 0);
        assert_eq!(
            TransportEvent::Message(typing(3)).kind(),
            TransportEventKind::Message(MessageKind::TypingStatus)
        );
    }

    #[test]
    fn unknown_types_are_surfaced() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions =
            transport.handle_text(r#"{"compressed":false,"timestamp":1,"data":{"type":"sticker"}}"#, t0);

        assert_eq!(actions, vec![TransportAction::Emit(TransportEvent::Unknown {
            kind: "sticker".into()
        })]);
    }

    #[test]
    fn undecodable_compressed_frame_is_skipped() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions =
            transport.handle_text(r#"{"compressed":true,"timestamp":1,"data":"eyJ0eXBlIjoicGluZyJ9"}"#, t0);

        assert!(actions.is_empty());
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[test]
    fn keepalive_fires_on_interval() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        assert!(transport.tick(t0 + Duration::from_secs(29)).is_empty());
        assert_eq!(transport.next_deadline(), Some(t0 + DEFAULT_KEEPALIVE_INTERVAL));

        let t1 = t0 + DEFAULT_KEEPALIVE_INTERVAL;
        let actions = transport.tick(t1);
        let texts = sent_texts(&actions);
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains(r#""type":"ping""#));
        assert_eq!(transport.next_deadline(), Some(t1 + DEFAULT_KEEPALIVE_INTERVAL));
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let config = TransportConfig::default();
        let delays: Vec<u64> = (1..=7).map(|a| config.backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn abnormal_drops_back_off_then_give_up() {
        let t0 = Instant::now();
        let mut transport = connected(t0);
        let mut now = t0;
        let mut delays = Vec::new();

        for _ in 0..5 {
            let actions = transport.handle_closed(1006, "abnormal", now);
            let [TransportAction::Emit(TransportEvent::Reconnecting { delay, .. })] = actions.as_slice()
            else {
                unreachable!("expected a scheduled reconnect, got {actions:?}");
            };
            delays.push(delay.as_secs());
            assert_eq!(transport.state(), ConnectionState::Connecting);

            now = transport.next_deadline().unwrap();
            let reopen = transport.tick(now);
            assert!(matches!(reopen.as_slice(), [TransportAction::Open { .. }]));
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16]);

        // Sixth drop in the same outage exhausts the budget
        let actions = transport.handle_closed(1006, "abnormal", now);
        assert_eq!(actions, vec![TransportAction::Emit(TransportEvent::ConnectionLost { attempts: 5 })]);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(transport.next_deadline(), None);
    }

    #[test]
    fn successful_open_resets_budget() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        transport.handle_closed(1006, "abnormal", t0);
        transport.handle_closed(1006, "abnormal", t0);
        assert_eq!(transport.reconnect_attempts(), 2);

        let t1 = transport.next_deadline().unwrap();
        transport.tick(t1);
        transport.handle_opened(t1);
        assert_eq!(transport.reconnect_attempts(), 0);
    }

    #[test]
    fn credential_change_resets_budget() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        transport.handle_closed(1006, "abnormal", t0);
        transport.handle_closed(1006, "abnormal", t0);
        assert_eq!(transport.reconnect_attempts(), 2);

        transport.set_credential("token-1");
        assert_eq!(transport.reconnect_attempts(), 2);

        transport.set_credential("token-2");
        assert_eq!(transport.reconnect_attempts(), 0);
    }

    #[test]
    fn auth_rejection_clears_credential_and_schedules_nothing() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions = transport.handle_closed(AUTH_REJECTED, "token expired", t0);

        assert_eq!(actions, vec![TransportAction::Emit(TransportEvent::AuthExpired)]);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!transport.has_credential());
        assert_eq!(transport.next_deadline(), None);
    }

    #[test]
    fn unauthorized_upgrade_is_auth_rejection() {
        let t0 = Instant::now();
        let mut transport = transport(t0);
        transport.connect("alice").unwrap();

        let actions = transport.handle_connect_failed(ConnectFailure::Unauthorized, t0);

        assert_eq!(actions, vec![TransportAction::Emit(TransportEvent::AuthExpired)]);
        assert!(!transport.has_credential());
    }

    #[test]
    fn network_failure_during_connect_backs_off() {
        let t0 = Instant::now();
        let mut transport = transport(t0);
        transport.connect("alice").unwrap();

        let actions = transport.handle_connect_failed(ConnectFailure::Network("refused".into()), t0);

        assert_eq!(actions, vec![TransportAction::Emit(TransportEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(1)
        })]);
    }

    #[test]
    fn server_normal_close_does_not_reconnect() {
        let t0 = Instant::now();
        let mut transport = connected(t0);

        let actions = transport.handle_closed(NORMAL_CLOSURE, "bye", t0);

        assert!(matches!(actions[0], TransportAction::Emit(TransportEvent::Disconnected { code: 1000, .. })));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_clears_queue_and_deadlines() {
        let t0 = Instant::now();
        let mut transport = transport(t0);
        transport.send(&typing(1), t0).unwrap();
        transport.connect("alice").unwrap();
        transport.handle_closed(1006, "abnormal", t0);
        assert!(transport.next_deadline().is_some());

        let actions = transport.disconnect();

        assert_eq!(actions, vec![TransportAction::Close {
            code: NORMAL_CLOSURE,
            reason: "client disconnect".into()
        }]);
        assert_eq!(transport.state(), ConnectionState::Closing);
        assert_eq!(transport.queued(), 0);
        assert_eq!(transport.next_deadline(), None);

        let actions = transport.handle_closed(NORMAL_CLOSURE, "client disconnect", t0);
        assert!(matches!(actions[0], TransportAction::Emit(TransportEvent::Disconnected { .. })));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn drop_during_closing_does_not_reconnect() {
        let t0 = Instant::now();
        let mut transport = connected(t0);
        transport.disconnect();

        transport.handle_closed(1006, "abnormal", t0);

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(transport.next_deadline(), None);
    }
}
