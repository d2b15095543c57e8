//! Reset-stream chunk accumulator.
//!
//! A streamed session reset arrives as `ResetStream` messages whose payloads
//! are arbitrary slices of a concatenated message stream. The consumer
//! buffers those slices and dispatches each complete inner message to a
//! sink callback as soon as it can be framed:
//!
//! ```text
//! chunk: [..msg1][msg2 pt1]   chunk: [msg2 pt2][..msg3]
//!            │                          │
//!            ▼                          ▼
//!        sink(msg1)              sink(msg2) sink(msg3)
//! ```
//!
//! The sink returns `false` to reject a message; the consumer then stops
//! and the push reports failure, leaving the caller's error latch to say
//! why. Closing is two-phase: [`ResetStreamConsumer::finish`] drains and
//! verifies nothing is left half-framed, [`ResetStreamConsumer::discard`]
//! throws the buffer away.

use crate::message::{Message, MessageError};

/// Accumulates reset-stream payload bytes and emits decoded messages.
#[derive(Debug, Default)]
pub struct ResetStreamConsumer {
    buffer: Vec<u8>,
}

impl ResetStreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes buffered awaiting completion.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append chunk bytes and dispatch every complete message to `sink`.
    ///
    /// Returns false when the sink rejects a message or the stream contains
    /// undecodable framing; remaining bytes stay buffered.
    pub fn push(&mut self, data: &[u8], sink: impl FnMut(Message) -> bool) -> bool {
        self.buffer.extend_from_slice(data);
        self.drain(sink)
    }

    /// Drain any remaining complete messages and verify the stream ended on
    /// a message boundary. Consumes the consumer.
    pub fn finish(mut self, sink: impl FnMut(Message) -> bool) -> bool {
        self.drain(sink) && self.buffer.is_empty()
    }

    /// Drop all buffered bytes without dispatching them.
    pub fn discard(self) {}

    fn drain(&mut self, mut sink: impl FnMut(Message) -> bool) -> bool {
        let mut offset = 0;
        let ok = loop {
            match Message::decode(&self.buffer[offset..]) {
                Ok((msg, consumed)) => {
                    if !sink(msg) {
                        // The rejected message stays buffered, so a later
                        // drain re-dispatches it and hits the same verdict
                        break false;
                    }
                    offset += consumed;
                }
                Err(MessageError::Truncated) => break true,
                Err(err) => {
                    log::warn!("undecodable reset stream contents: {err}");
                    break false;
                }
            }
        };
        self.buffer.drain(..offset);
        ok
    }
}
