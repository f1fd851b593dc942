//! Fuzz target for the transport state machine
//!
//! Drives `Transport` with arbitrary sequences of socket events, sends,
//! inbound frames and clock advances.
//!
//! # Invariants
//!
//! - Never panics on any event order
//! - The offline queue never exceeds its capacity
//! - Reconnect attempts never exceed the budget, and every scheduled delay
//!   stays within the backoff cap
//! - After `disconnect` nothing is scheduled until the next `connect`
//! - Queued frames reach the wire in enqueue order

#![no_main]

use std::time::{Duration, Instant};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parley_core::{
    ConnectFailure, ConnectionState, Transport, TransportAction, TransportConfig, TransportEvent,
};
use parley_proto::{Message, TypingStatus};

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    SetCredential(u8),
    Connect(u8),
    Opened,
    ConnectFailed { unauthorized: bool },
    Closed { code: u16 },
    Send,
    InboundText(String),
    Disconnect,
    Advance { millis: u16 },
}

fuzz_target!(|ops: Vec<Op>| {
    let config = TransportConfig { queue_capacity: 8, ..TransportConfig::default() };
    let mut now = Instant::now();
    let mut transport = Transport::new(config.clone(), now, 1_700_000_000_000);

    let mut next_id = 0u32;
    let mut queued: Vec<String> = Vec::new();

    for op in ops {
        let actions = match op {
            Op::SetCredential(n) => {
                transport.set_credential(format!("token-{n}"));
                Vec::new()
            },
            Op::Connect(n) => {
                let identity = format!("user-{}", n % 3);
                transport.connect(&identity).unwrap_or_default()
            },
            Op::Opened => transport.handle_opened(now),
            Op::ConnectFailed { unauthorized } => {
                let failure = if unauthorized {
                    ConnectFailure::Unauthorized
                } else {
                    ConnectFailure::Network("refused".to_string())
                };
                transport.handle_connect_failed(failure, now)
            },
            Op::Closed { code } => transport.handle_closed(code, "", now),
            Op::Send => {
                next_id += 1;
                let message = Message::TypingStatus(TypingStatus {
                    from: "fuzz".to_string(),
                    to: format!("peer-{next_id}"),
                    is_typing: true,
                });
                let connected = transport.state() == ConnectionState::Connected;
                match transport.send(&message, now) {
                    Ok(actions) => {
                        if !connected {
                            assert!(actions.is_empty());
                            queued.push(format!("\"peer-{next_id}\""));
                        }
                        actions
                    },
                    Err(_) => {
                        assert_eq!(transport.queued(), config.queue_capacity);
                        Vec::new()
                    },
                }
            },
            Op::InboundText(text) => transport.handle_text(&text, now),
            Op::Disconnect => {
                let actions = transport.disconnect();
                queued.clear();
                assert_eq!(transport.next_deadline(), None);
                assert_eq!(transport.queued(), 0);
                actions
            },
            Op::Advance { millis } => {
                now += Duration::from_millis(u64::from(millis));
                transport.tick(now)
            },
        };

        if transport.queued() == 0 {
            // flushed on open, or dropped by an identity switch or auth failure
            let flushed: Vec<&str> = actions
                .iter()
                .filter_map(|a| match a {
                    TransportAction::Send(text) => Some(text.as_str()),
                    _ => None,
                })
                .filter(|text| text.contains("typing_status"))
                .collect();
            if !flushed.is_empty() && flushed.len() == queued.len() {
                for (text, peer) in flushed.iter().zip(&queued) {
                    assert!(text.contains(peer.as_str()), "queue flushed out of order");
                }
            }
            queued.clear();
        }

        assert!(transport.queued() <= config.queue_capacity);
        assert!(transport.reconnect_attempts() <= config.max_reconnect_attempts);
        for action in &actions {
            if let TransportAction::Emit(TransportEvent::Reconnecting { attempt, delay }) = action {
                assert!(*attempt >= 1 && *attempt <= config.max_reconnect_attempts);
                assert!(*delay <= config.backoff_cap);
            }
        }
    }
});
