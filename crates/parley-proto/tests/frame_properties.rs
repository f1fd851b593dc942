//! Property-based tests for frame encoding and decoding
//!
//! Both the plain and the compressed encodings must deliver the same message,
//! and arbitrary input text must never panic the decoder.

use parley_proto::{
    Decoded, EncryptionReady, ExchangeStatus, KeyExchange, KeyRotationRequired, Message,
    TypingStatus, WireEnvelope, decode_frame,
};
use proptest::prelude::*;

fn identity() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,16}"
}

fn arbitrary_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        Just(Message::Ping),
        Just(Message::Pong),
        (identity(), identity(), "[a-zA-Z0-9+/]{4,44}", any::<bool>(), any::<bool>()).prop_map(
            |(from, to, public_key, ready, rotation)| {
                Message::KeyExchange(KeyExchange {
                    session_id: format!("{from}:{to}"),
                    from,
                    to,
                    public_key,
                    status: if ready { ExchangeStatus::Ready } else { ExchangeStatus::Pending },
                    rotation,
                })
            }
        ),
        (identity(), identity()).prop_map(|(from, to)| {
            Message::EncryptionReady(EncryptionReady { session_id: format!("{from}:{to}"), from, to })
        }),
        (identity(), identity(), prop::option::of(".{0,32}")).prop_map(|(from, to, reason)| {
            Message::KeyRotationRequired(KeyRotationRequired {
                session_id: format!("{from}:{to}"),
                from,
                to,
                reason,
            })
        }),
        (identity(), identity(), any::<bool>()).prop_map(|(from, to, is_typing)| {
            Message::TypingStatus(TypingStatus { from, to, is_typing })
        }),
    ]
}

#[test]
fn prop_plain_frame_roundtrip() {
    proptest!(|(message in arbitrary_message(), timestamp in any::<u64>())| {
        let text = WireEnvelope::new(&message, timestamp).unwrap().to_text().unwrap();
        let (frame, decoded) = decode_frame(&text).expect("decode plain frame");

        prop_assert!(!frame.compressed);
        prop_assert_eq!(frame.timestamp, timestamp);
        prop_assert_eq!(decoded, Decoded::Known(message));
    });
}

#[test]
fn prop_compressed_frame_roundtrip() {
    proptest!(|(message in arbitrary_message(), timestamp in any::<u64>())| {
        let text = WireEnvelope::compressed(&message, timestamp).unwrap().to_text().unwrap();
        let (frame, decoded) = decode_frame(&text).expect("decode compressed frame");

        prop_assert!(frame.compressed);
        prop_assert_eq!(decoded, Decoded::Known(message));
    });
}

#[test]
fn prop_decoder_never_panics_on_arbitrary_text() {
    proptest!(|(text in ".{0,512}")| {
        let _ = decode_frame(&text);
    });
}

#[test]
fn prop_unknown_types_survive_decoding() {
    proptest!(|(kind in "[a-z]{3,12}_x")| {
        let text = format!(r#"{{"compressed":false,"timestamp":1,"data":{{"type":"{kind}","n":1}}}}"#);
        let (_, decoded) = decode_frame(&text).expect("unknown types are not errors");

        let is_unknown = matches!(decoded, Decoded::Unknown { kind: ref k, .. } if *k == kind);
        prop_assert!(is_unknown);
    });
}
