//! Text rendering of session and connection events.

use parley_client::{MessageBody, SessionEvent, SessionState};
use parley_core::TransportEvent;

/// One line for a session event.
pub fn session_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::EncryptionReady { peer, fingerprint, local_fingerprint, .. } => {
            format!("* encrypted session with {peer}, theirs {fingerprint}, ours {local_fingerprint}")
        },
        SessionEvent::PeerConfirmed { peer } => format!("* {peer} confirmed the session"),
        SessionEvent::RotationStarted { peer } => format!("* rotating key with {peer}"),
        SessionEvent::HandshakeTimedOut { peer, fallback } => match fallback {
            SessionState::Active => format!("* key rotation with {peer} timed out, keeping current key"),
            _ => format!("* {peer} did not answer the key exchange"),
        },
        SessionEvent::SessionClosed { peer } => format!("* session with {peer} closed"),
        SessionEvent::MessageReceived(message) => match &message.body {
            MessageBody::Plaintext(bytes) => {
                format!("<{}> {}", message.from, String::from_utf8_lossy(bytes))
            },
            MessageBody::Undecryptable { .. } => {
                format!("<{}> [message could not be decrypted]", message.from)
            },
        },
    }
}

/// One line for a connection event worth showing, if any.
pub fn transport_event(event: &TransportEvent) -> Option<String> {
    match event {
        TransportEvent::Connected => Some("* connected".to_string()),
        TransportEvent::Disconnected { code, reason } if reason.is_empty() => {
            Some(format!("* disconnected ({code})"))
        },
        TransportEvent::Disconnected { code, reason } => Some(format!("* disconnected ({code}: {reason})")),
        TransportEvent::Reconnecting { attempt, delay } => {
            Some(format!("* connection lost, retry {attempt} in {}s", delay.as_secs()))
        },
        TransportEvent::AuthExpired => Some("* credential rejected by server".to_string()),
        TransportEvent::ConnectionLost { attempts } => {
            Some(format!("* gave up after {attempts} reconnect attempts"))
        },
        TransportEvent::Message(_) | TransportEvent::Unknown { .. } => None,
    }
}

/// Human-readable state name.
pub fn state(state: SessionState) -> &'static str {
    match state {
        SessionState::NoSession => "none",
        SessionState::KeyExchangeInitiated => "exchanging keys",
        SessionState::AwaitingPeer => "waiting for peer",
        SessionState::Active => "active",
        SessionState::Rotating => "rotating",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_client::DecryptedMessage;

    use super::*;

    fn received(body: MessageBody) -> SessionEvent {
        SessionEvent::MessageReceived(DecryptedMessage {
            id: "m1".into(),
            from: "bob".into(),
            session_id: "alice:bob".into(),
            body,
        })
    }

    #[test]
    fn chat_lines() {
        insta::assert_snapshot!(
            session_event(&received(MessageBody::Plaintext(b"hello".to_vec()))),
            @"<bob> hello"
        );
        insta::assert_snapshot!(
            session_event(&received(MessageBody::Undecryptable { reason: "authentication failed".into() })),
            @"<bob> [message could not be decrypted]"
        );
    }

    #[test]
    fn session_lines() {
        let ready = SessionEvent::EncryptionReady {
            peer: "bob".into(),
            session_id: "alice:bob".into(),
            fingerprint: "fp-1234".into(),
            local_fingerprint: "fp-5678".into(),
        };
        insta::assert_snapshot!(session_event(&ready), @"* encrypted session with bob, theirs fp-1234, ours fp-5678");

        let timed_out =
            SessionEvent::HandshakeTimedOut { peer: "bob".into(), fallback: SessionState::Active };
        insta::assert_snapshot!(session_event(&timed_out), @"* key rotation with bob timed out, keeping current key");
    }

    #[test]
    fn connection_lines() {
        let retry = TransportEvent::Reconnecting { attempt: 2, delay: Duration::from_secs(2) };
        insta::assert_snapshot!(transport_event(&retry).unwrap(), @"* connection lost, retry 2 in 2s");

        let closed = TransportEvent::Disconnected { code: 1000, reason: String::new() };
        insta::assert_snapshot!(transport_event(&closed).unwrap(), @"* disconnected (1000)");

        assert_eq!(transport_event(&TransportEvent::Unknown { kind: "x".into() }), None);
    }
}
