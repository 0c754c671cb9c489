//! Terminator-delimited frame assembler.
//!
//! Bytes from the target device arrive in arbitrary pieces. The framer
//! accumulates them and yields one frame per `0x0A` terminator, the
//! terminator included:
//!
//! ```text
//!   feed [01 02]        → (nothing)
//!   feed [0A 03 0A 04]  → [01 02 0A], [03 0A]     buffered: [04]
//! ```
//!
//! A frame that grows past [`MAX_FRAME_LEN`] without a terminator is
//! flushed as-is so relayed bytes are never dropped.

/// Frame terminator (line feed).
pub const FRAME_TERMINATOR: u8 = 0x0A;

/// Largest frame that fits one GATT attribute value.
pub const MAX_FRAME_LEN: usize = 512;

/// Streaming 0x0A framer.
///
/// Frames normally end at [`FRAME_TERMINATOR`]. When [`MAX_FRAME_LEN`]
/// bytes accumulate without one, those bytes are emitted as an
/// unterminated frame and assembly restarts with the next byte.
pub struct InboundFramer {
    buf: heapless::Vec<u8, MAX_FRAME_LEN>,
}

impl Default for InboundFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundFramer {
    pub const fn new() -> Self {
        Self {
            buf: heapless::Vec::new(),
        }
    }

    /// Append `data`, calling `on_frame` once for every completed frame.
    ///
    /// Returns the number of frames emitted.
    pub fn feed(&mut self, data: &[u8], mut on_frame: impl FnMut(&[u8])) -> usize {
        let mut emitted = 0;
        for &byte in data {
            // Capacity is checked first, so the push cannot fail.
            let _ = self.buf.push(byte);
            if byte == FRAME_TERMINATOR || self.buf.is_full() {
                on_frame(&self.buf);
                self.buf.clear();
                emitted += 1;
            }
        }
        emitted
    }

    /// Bytes of the current partial frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Drop any partial frame (e.g. after the link goes down).
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
