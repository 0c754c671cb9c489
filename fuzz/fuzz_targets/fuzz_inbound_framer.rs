//! Fuzz target: `InboundFramer::feed`
//!
//! Feeds arbitrary target-side bytes, split at the first input byte, and
//! checks that no byte is lost and no frame outgrows one attribute value.
//!
//! cargo fuzz run fuzz_inbound_framer

#![no_main]

use libfuzzer_sys::fuzz_target;
use x1bridge::link::framer::{FRAME_TERMINATOR, InboundFramer, MAX_FRAME_LEN};

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let split = usize::from(split).min(rest.len());

    let mut framer = InboundFramer::new();
    let mut out = Vec::with_capacity(rest.len());
    for piece in [&rest[..split], &rest[split..]] {
        framer.feed(piece, |frame| {
            assert!(!frame.is_empty());
            assert!(frame.len() <= MAX_FRAME_LEN);
            assert!(frame.ends_with(&[FRAME_TERMINATOR]) || frame.len() == MAX_FRAME_LEN);
            out.extend_from_slice(frame);
        });
    }
    out.extend_from_slice(framer.pending());
    assert_eq!(out, rest, "framer lost or reordered bytes");

    framer.reset();
    assert!(framer.pending().is_empty());
});
