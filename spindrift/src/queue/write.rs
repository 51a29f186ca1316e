//! The write queue: pending sends, watermarked by payload bytes.

use std::collections::VecDeque;
use std::sync::Arc;

use spindrift_core::endpoint::Endpoint;
use spindrift_core::error::{Error, ErrorKind, Result};
use spindrift_core::operation::{SendPayload, Token};
use spindrift_core::watermark::Watermarks;
use spindrift_mux::strand::Strand;
use spindrift_mux::timer::Timer;

use crate::queue::QueueEvent;
use crate::socket::SendCallback;

/// One queued send.
pub struct WriteEntry {
    /// The operation token.
    pub token: Token,
    /// The payload, pinned until the entry completes.
    pub payload: SendPayload,
    /// How many payload bytes the OS has taken so far.
    pub progress: usize,
    /// The target endpoint, for datagram sends.
    pub target: Option<Endpoint>,
    /// The user completion handler.
    pub callback: Option<SendCallback>,
    /// The send's own strand, when the caller supplied one.
    pub strand: Option<Arc<Strand>>,
    /// The armed deadline; dropped (and thereby cancelled) with the
    /// entry.
    pub deadline: Option<Timer>,
}

impl WriteEntry {
    /// How many payload bytes remain unsent.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload.len().saturating_sub(self.progress)
    }
}

/// An ordered queue of pending sends.
pub struct WriteQueue {
    entries: VecDeque<WriteEntry>,
    marks: Watermarks,
}

impl WriteQueue {
    /// Create a write queue with the specified watermarks.
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            marks: Watermarks::new(low_watermark, high_watermark),
        }
    }

    /// The number of queued bytes not yet handed to the OS.
    #[must_use]
    pub fn size(&self) -> usize {
        self.marks.current()
    }

    /// True if no entry is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The queue's watermarks.
    #[must_use]
    pub fn watermarks(&self) -> &Watermarks {
        &self.marks
    }

    /// Enqueue a send. Fails with `LIMIT` — enqueueing nothing — when
    /// the payload would push the queue past its high watermark.
    pub fn push(&mut self, entry: WriteEntry) -> Result<Option<QueueEvent>> {
        let len = entry.payload.len();
        if self.marks.would_exceed_high(len) {
            return Err(Error::new(ErrorKind::Limit));
        }
        let crossed = self.marks.add(len);
        self.entries.push_back(entry);
        Ok(crossed.then(|| QueueEvent::high(&self.marks)))
    }

    /// The entry at the head of the queue.
    #[must_use]
    pub fn front_mut(&mut self) -> Option<&mut WriteEntry> {
        self.entries.front_mut()
    }

    /// Record `sent` bytes of the head entry handed to the OS.
    pub fn record_progress(&mut self, sent: usize) -> Option<QueueEvent> {
        self.marks
            .subtract(sent)
            .then(|| QueueEvent::low(&self.marks))
    }

    /// Remove the head entry once its payload is fully transferred.
    pub fn pop_front(&mut self) -> Option<WriteEntry> {
        self.entries.pop_front()
    }

    /// Remove the not-yet-started entry with the specified `token`.
    pub fn cancel(&mut self, token: Token) -> Option<(WriteEntry, Option<QueueEvent>)> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.token == token && entry.progress == 0)?;
        let entry = self.entries.remove(position)?;
        let event = self
            .marks
            .subtract(entry.remaining())
            .then(|| QueueEvent::low(&self.marks));
        Some((entry, event))
    }

    /// Remove every entry, for terminal failure or detach.
    pub fn drain(&mut self) -> (Vec<WriteEntry>, Option<QueueEvent>) {
        let mut event = None;
        let entries: Vec<WriteEntry> = self.entries.drain(..).collect();
        for entry in &entries {
            if self.marks.subtract(entry.remaining()) {
                event = Some(QueueEvent::low(&self.marks));
            }
        }
        (entries, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueEventKind;
    use bytes::Bytes;

    fn entry(token: u64, payload: &'static [u8]) -> WriteEntry {
        WriteEntry {
            token: Token(token),
            payload: SendPayload::from(Bytes::from_static(payload)),
            progress: 0,
            target: None,
            callback: None,
            strand: None,
            deadline: None,
        }
    }

    #[test]
    fn high_watermark_rejects_without_partial_enqueue() {
        let mut queue = WriteQueue::new(0, 4);
        assert!(queue.push(entry(1, b"abc")).unwrap().is_none());
        assert_eq!(queue.size(), 3);

        let err = queue.push(entry(2, b"xyz")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Limit);
        assert_eq!(queue.size(), 3);

        // The edge fires once when the high watermark is reached.
        let event = queue.push(entry(3, b"z")).unwrap().unwrap();
        assert_eq!(event.kind, QueueEventKind::HighWatermark);
        assert_eq!(event.context.current, 4);
    }

    #[test]
    fn drain_to_low_watermark_emits_one_edge() {
        let mut queue = WriteQueue::new(0, 4);
        for (token, payload) in [(1, b"a"), (2, b"b"), (3, b"c"), (4, b"d")] {
            let _ = queue.push(entry(token, payload)).unwrap();
        }
        assert!(queue.watermarks().is_breached());

        let mut low_events = 0;
        for _ in 0..4 {
            let head = queue.front_mut().unwrap();
            head.progress += 1;
            if queue.record_progress(1).is_some() {
                low_events += 1;
            }
            queue.pop_front();
        }
        assert_eq!(low_events, 1);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn cancel_only_unstarted_entries() {
        let mut queue = WriteQueue::new(0, 64);
        let _ = queue.push(entry(1, b"abcd")).unwrap();
        let _ = queue.push(entry(2, b"efgh")).unwrap();

        queue.front_mut().unwrap().progress = 2;
        assert!(queue.cancel(Token(1)).is_none());

        let (cancelled, _event) = queue.cancel(Token(2)).unwrap();
        assert_eq!(cancelled.token, Token(2));
        assert_eq!(queue.size(), 4);
    }

    #[test]
    fn oversized_payload_is_rejected_outright() {
        let mut queue = WriteQueue::new(0, 4);
        assert_eq!(
            queue.push(entry(1, b"abcdefgh")).unwrap_err().kind(),
            ErrorKind::Limit
        );
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
    }
}
