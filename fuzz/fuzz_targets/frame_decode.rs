//! Fuzz target for wire frame decoding
//!
//! Feeds arbitrary text through `decode_frame`, including the gzip+base64
//! path behind `compressed: true`.
//!
//! # Invariants
//!
//! - Decoding NEVER panics; malformed frames return an error
//! - A frame that decodes re-encodes and decodes to the same message
//! - Compressed payloads that inflate past the size cap are rejected, not
//!   allocated

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::{Decoded, WireEnvelope, decode_frame};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    let Ok((frame, decoded)) = decode_frame(&text) else {
        return;
    };

    if let Decoded::Known(message) = decoded {
        let reencoded = WireEnvelope::new(&message, frame.timestamp)
            .and_then(|f| f.to_text())
            .expect("decoded message must re-encode");
        match decode_frame(&reencoded) {
            Ok((_, Decoded::Known(again))) => assert_eq!(again, message),
            other => panic!("re-encoded frame did not decode: {other:?}"),
        }
    }
});
