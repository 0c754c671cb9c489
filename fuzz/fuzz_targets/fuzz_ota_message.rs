//! Fuzz target: `OtaMessage::decode`
//!
//! Arbitrary writes to the OTA characteristic must decode or be rejected
//! without panicking. Accepted messages re-encode to the exact input.
//!
//! cargo fuzz run fuzz_ota_message

#![no_main]

use libfuzzer_sys::fuzz_target;
use x1bridge::protocol::codec::OtaMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = OtaMessage::decode(data) {
        assert_eq!(message.encode(), data, "decode/encode disagree");
        if let OtaMessage::Finish { signature } = message {
            assert!(signature.len() <= 72, "oversized signature accepted");
        }
    }
});
