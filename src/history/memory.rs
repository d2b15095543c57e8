//! In-memory history backend.
//!
//! Keeps the retained log, the pending reset log and the thumbnail in
//! process memory. This is the backend for sessions that don't need to
//! survive a server restart; the engine's logical contract is identical
//! for disk-backed implementations.

use chrono::{DateTime, Utc};

use crate::history::{
    HistoryBackend, ResolvedResetStream, StreamResetAddResult, StreamResetPrepareResult,
    StreamResetStartResult,
};
use crate::message::Message;

/// Policy knobs and log storage, all in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    messages: Vec<Message>,
    /// Global index of `messages[0]`.
    first_index: i64,
    pending: Option<Vec<Message>>,
    thumbnail: Option<(Vec<u8>, DateTime<Utc>)>,
    override_size_limit: usize,
    auto_reset_threshold: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transient size limit override (0 = none).
    pub fn set_override_size_limit(&mut self, limit: usize) {
        self.override_size_limit = limit;
    }

    /// Set the auto-reset threshold (0 = disabled).
    pub fn set_auto_reset_threshold(&mut self, threshold: usize) {
        self.auto_reset_threshold = threshold;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn thumbnail(&self) -> Option<&[u8]> {
        self.thumbnail.as_ref().map(|(data, _)| data.as_slice())
    }
}

impl HistoryBackend for MemoryBackend {
    fn history_add(&mut self, msg: &Message) {
        self.messages.push(msg.clone());
    }

    fn history_reset(&mut self, messages: &[Message]) {
        self.first_index += self.messages.len() as i64;
        self.messages = messages.to_vec();
    }

    fn get_batch(&self, after_index: i64) -> (Vec<Message>, i64) {
        let last_index = self.first_index + self.messages.len() as i64 - 1;
        let start = (after_index + 1 - self.first_index).max(0) as usize;
        let batch = self.messages.get(start..).unwrap_or_default().to_vec();
        (batch, last_index)
    }

    fn open_reset_stream(&mut self, seed: &[Message]) -> StreamResetStartResult {
        self.pending = Some(seed.to_vec());
        StreamResetStartResult::Ok
    }

    fn add_reset_stream_message(&mut self, msg: &Message) -> StreamResetAddResult {
        match &mut self.pending {
            Some(pending) => {
                pending.push(msg.clone());
                StreamResetAddResult::Ok
            }
            None => StreamResetAddResult::NotActive,
        }
    }

    fn prepare_reset_stream(&mut self) -> StreamResetPrepareResult {
        if self.pending.is_some() {
            StreamResetPrepareResult::Ok
        } else {
            StreamResetPrepareResult::ConsumerError
        }
    }

    fn resolve_reset_stream(
        &mut self,
        new_first_index: i64,
    ) -> Result<ResolvedResetStream, String> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| String::from("no pending reset stream"))?;
        let resolved = ResolvedResetStream {
            message_count: pending.len() as i64,
            size_in_bytes: pending.iter().map(Message::length).sum(),
        };
        self.messages = pending;
        self.first_index = new_first_index;
        Ok(resolved)
    }

    fn discard_reset_stream(&mut self) {
        self.pending = None;
    }

    fn has_thumbnail(&self) -> bool {
        self.thumbnail.is_some()
    }

    fn thumbnail_generated_at(&self) -> Option<DateTime<Utc>> {
        self.thumbnail.as_ref().map(|(_, at)| *at)
    }

    fn set_thumbnail(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            self.thumbnail = None;
        } else {
            self.thumbnail = Some((data.to_vec(), Utc::now()));
        }
        true
    }

    fn override_size_limit(&self) -> usize {
        self.override_size_limit
    }

    fn auto_reset_threshold(&self) -> usize {
        self.auto_reset_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn msg(payload_len: usize) -> Message {
        Message::new(MessageType::DrawDabs, 1, vec![0u8; payload_len])
    }

    #[test]
    fn test_get_batch_from_start() {
        let mut backend = MemoryBackend::new();
        backend.history_add(&msg(1));
        backend.history_add(&msg(2));
        backend.history_add(&msg(3));

        let (batch, last) = backend.get_batch(-1);
        assert_eq!(batch.len(), 3);
        assert_eq!(last, 2);
    }

    #[test]
    fn test_get_batch_tail() {
        let mut backend = MemoryBackend::new();
        for i in 0..5 {
            backend.history_add(&msg(i));
        }
        let (batch, last) = backend.get_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(last, 4);
    }

    #[test]
    fn test_get_batch_after_reset_offsets_indices() {
        let mut backend = MemoryBackend::new();
        for i in 0..4 {
            backend.history_add(&msg(i));
        }
        backend.history_reset(&[msg(10), msg(11)]);

        // Retained range is now global indices 4..=5
        let (batch, last) = backend.get_batch(3);
        assert_eq!(batch.len(), 2);
        assert_eq!(last, 5);

        let (tail, _) = backend.get_batch(4);
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn test_reset_stream_lifecycle() {
        let mut backend = MemoryBackend::new();
        backend.history_add(&msg(100));

        assert_eq!(
            backend.open_reset_stream(&[msg(5)]),
            StreamResetStartResult::Ok
        );
        assert_eq!(
            backend.add_reset_stream_message(&msg(6)),
            StreamResetAddResult::Ok
        );
        assert_eq!(backend.prepare_reset_stream(), StreamResetPrepareResult::Ok);

        let resolved = backend.resolve_reset_stream(1).unwrap();
        assert_eq!(resolved.message_count, 2);
        assert_eq!(resolved.size_in_bytes, (5 + 4) + (6 + 4));
        assert_eq!(backend.message_count(), 2);

        // The old log is gone; the new one starts at index 1
        let (batch, last) = backend.get_batch(0);
        assert_eq!(batch.len(), 2);
        assert_eq!(last, 2);
    }

    #[test]
    fn test_reset_stream_discard() {
        let mut backend = MemoryBackend::new();
        backend.open_reset_stream(&[]);
        backend.add_reset_stream_message(&msg(1));
        backend.discard_reset_stream();
        assert!(backend.resolve_reset_stream(0).is_err());
        assert_eq!(
            backend.add_reset_stream_message(&msg(1)),
            StreamResetAddResult::NotActive
        );
    }

    #[test]
    fn test_thumbnail_set_and_purge() {
        let mut backend = MemoryBackend::new();
        assert!(!backend.has_thumbnail());

        assert!(backend.set_thumbnail(b"png-bytes"));
        assert!(backend.has_thumbnail());
        assert!(backend.thumbnail_generated_at().is_some());
        assert_eq!(backend.thumbnail(), Some(&b"png-bytes"[..]));

        assert!(backend.set_thumbnail(&[]));
        assert!(!backend.has_thumbnail());
    }
}
