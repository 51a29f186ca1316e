//! The read queue: received data waiting for user receives.
//!
//! Stream sockets accumulate a byte FIFO; datagram sockets keep whole
//! messages with their origin. Both are watermarked by bytes: growing
//! to the high watermark pauses copying from the OS, draining to the
//! low watermark resumes it.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use spindrift_core::endpoint::Endpoint;
use spindrift_core::operation::Token;
use spindrift_core::watermark::Watermarks;
use spindrift_mux::timer::Timer;

use crate::queue::QueueEvent;
use crate::socket::ReceiveCallback;

/// One pending receive.
pub struct ReadOp {
    /// The operation token.
    pub token: Token,
    /// The most bytes the receive will deliver.
    pub size: usize,
    /// The fewest bytes before the receive completes.
    pub min: usize,
    /// The user completion handler.
    pub callback: Option<ReceiveCallback>,
    /// The armed deadline; dropped (and thereby cancelled) with the op.
    pub deadline: Option<Timer>,
}

/// What satisfied a pending receive.
pub enum ReadReady {
    /// Data was delivered.
    Data(ReadOp, Bytes),
    /// The stream ended with nothing left to deliver.
    Eof(ReadOp),
}

/// A byte FIFO of received stream data plus pending receives.
pub struct ReadQueue {
    data: BytesMut,
    pending: VecDeque<ReadOp>,
    marks: Watermarks,
    eof: bool,
}

impl ReadQueue {
    /// Create a read queue with the specified watermarks.
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            data: BytesMut::new(),
            pending: VecDeque::new(),
            marks: Watermarks::new(low_watermark, high_watermark),
            eof: false,
        }
    }

    /// The number of buffered bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The queue's watermarks.
    #[must_use]
    pub fn watermarks(&self) -> &Watermarks {
        &self.marks
    }

    /// True once the peer has shut down its send direction.
    #[must_use]
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Mark the stream ended.
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Append bytes copied from the OS receive buffer.
    pub fn append(&mut self, bytes: &[u8]) -> Option<QueueEvent> {
        self.data.extend_from_slice(bytes);
        self.marks
            .add(bytes.len())
            .then(|| QueueEvent::high(&self.marks))
    }

    /// Park a receive until enough data arrives.
    pub fn push_op(&mut self, op: ReadOp) {
        self.pending.push_back(op);
    }

    /// True when the front pending receive can complete right now.
    #[must_use]
    pub fn front_satisfiable(&self) -> bool {
        match self.pending.front() {
            Some(op) => self.data.len() >= op.min || self.eof,
            None => false,
        }
    }

    /// Complete the front pending receive if it is satisfiable.
    ///
    /// At end of stream, remaining data shorter than the minimum is
    /// still delivered; only an empty queue reports end-of-file.
    pub fn pop_satisfiable(&mut self) -> Option<(ReadReady, Option<QueueEvent>)> {
        if !self.front_satisfiable() {
            return None;
        }
        let op = self.pending.pop_front()?;
        if self.data.is_empty() {
            debug_assert!(self.eof);
            return Some((ReadReady::Eof(op), None));
        }
        let take = op.size.min(self.data.len());
        let bytes = self.data.split_to(take).freeze();
        let event = self
            .marks
            .subtract(take)
            .then(|| QueueEvent::low(&self.marks));
        Some((ReadReady::Data(op, bytes), event))
    }

    /// Take up to `max` buffered bytes without a pending receive.
    pub fn take(&mut self, max: usize) -> (Bytes, Option<QueueEvent>) {
        let take = max.min(self.data.len());
        let bytes = self.data.split_to(take).freeze();
        let event = self
            .marks
            .subtract(take)
            .then(|| QueueEvent::low(&self.marks));
        (bytes, event)
    }

    /// Remove the pending receive with the specified `token`.
    pub fn cancel(&mut self, token: Token) -> Option<ReadOp> {
        let position = self.pending.iter().position(|op| op.token == token)?;
        self.pending.remove(position)
    }

    /// Remove every pending receive, for terminal failure or detach.
    pub fn drain_ops(&mut self) -> Vec<ReadOp> {
        self.pending.drain(..).collect()
    }

    /// True if any receive is parked.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// A message FIFO of received datagrams plus pending receives.
pub struct MessageQueue {
    messages: VecDeque<(Bytes, Endpoint)>,
    pending: VecDeque<ReadOp>,
    marks: Watermarks,
}

impl MessageQueue {
    /// Create a message queue with the specified watermarks (bytes).
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            pending: VecDeque::new(),
            marks: Watermarks::new(low_watermark, high_watermark),
        }
    }

    /// The number of buffered payload bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.marks.current()
    }

    /// The queue's watermarks.
    #[must_use]
    pub fn watermarks(&self) -> &Watermarks {
        &self.marks
    }

    /// Append one received datagram.
    pub fn push_message(&mut self, bytes: Bytes, origin: Endpoint) -> Option<QueueEvent> {
        let len = bytes.len();
        self.messages.push_back((bytes, origin));
        self.marks.add(len).then(|| QueueEvent::high(&self.marks))
    }

    /// Park a receive until a message arrives.
    pub fn push_op(&mut self, op: ReadOp) {
        self.pending.push_back(op);
    }

    /// Complete the front pending receive with the front message.
    pub fn pop_satisfiable(&mut self) -> Option<(ReadOp, Bytes, Endpoint, Option<QueueEvent>)> {
        if self.messages.is_empty() || self.pending.is_empty() {
            return None;
        }
        let op = self.pending.pop_front()?;
        let (bytes, origin) = self.messages.pop_front()?;
        let event = self
            .marks
            .subtract(bytes.len())
            .then(|| QueueEvent::low(&self.marks));
        Some((op, bytes, origin, event))
    }

    /// The front message without a pending receive.
    pub fn pop_message(&mut self) -> Option<(Bytes, Endpoint, Option<QueueEvent>)> {
        let (bytes, origin) = self.messages.pop_front()?;
        let event = self
            .marks
            .subtract(bytes.len())
            .then(|| QueueEvent::low(&self.marks));
        Some((bytes, origin, event))
    }

    /// True if a message is buffered.
    #[must_use]
    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Remove the pending receive with the specified `token`.
    pub fn cancel(&mut self, token: Token) -> Option<ReadOp> {
        let position = self.pending.iter().position(|op| op.token == token)?;
        self.pending.remove(position)
    }

    /// Remove every pending receive, for terminal failure or detach.
    pub fn drain_ops(&mut self) -> Vec<ReadOp> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueEventKind;

    fn op(token: u64, size: usize, min: usize) -> ReadOp {
        ReadOp {
            token: Token(token),
            size,
            min,
            callback: None,
            deadline: None,
        }
    }

    #[test]
    fn receive_waits_for_minimum() {
        let mut queue = ReadQueue::new(0, 1024);
        queue.push_op(op(1, 16, 4));

        assert!(queue.append(b"ab").is_none());
        assert!(!queue.front_satisfiable());

        queue.append(b"cd");
        let (ready, _event) = queue.pop_satisfiable().unwrap();
        match ready {
            ReadReady::Data(op, bytes) => {
                assert_eq!(op.token, Token(1));
                assert_eq!(&bytes[..], b"abcd");
            }
            ReadReady::Eof(_) => panic!("unexpected eof"),
        }
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn eof_with_empty_queue_reports_eof() {
        let mut queue = ReadQueue::new(0, 1024);
        queue.push_op(op(1, 16, 1));
        queue.set_eof();

        let (ready, _event) = queue.pop_satisfiable().unwrap();
        assert!(matches!(ready, ReadReady::Eof(_)));
    }

    #[test]
    fn eof_delivers_short_remainder_first() {
        let mut queue = ReadQueue::new(0, 1024);
        queue.append(b"ab");
        queue.set_eof();

        queue.push_op(op(1, 16, 4));
        queue.push_op(op(2, 16, 4));

        let (ready, _event) = queue.pop_satisfiable().unwrap();
        assert!(matches!(ready, ReadReady::Data(_, ref bytes) if &bytes[..] == b"ab"));

        let (ready, _event) = queue.pop_satisfiable().unwrap();
        assert!(matches!(ready, ReadReady::Eof(_)));
    }

    #[test]
    fn watermark_edges_alternate() {
        let mut queue = ReadQueue::new(0, 4);
        assert!(queue.append(b"abc").is_none());
        let event = queue.append(b"d").unwrap();
        assert_eq!(event.kind, QueueEventKind::HighWatermark);

        // No duplicate high edge while breached.
        assert!(queue.append(b"e").is_none());

        let (_bytes, event) = queue.take(5);
        assert_eq!(event.unwrap().kind, QueueEventKind::LowWatermark);
    }

    #[test]
    fn message_queue_pairs_ops_with_messages() {
        let mut queue = MessageQueue::new(0, 1024);
        let origin = Endpoint::parse("127.0.0.1:9000").unwrap();

        queue.push_op(op(1, 64, 1));
        assert!(queue.pop_satisfiable().is_none());

        queue.push_message(Bytes::from_static(b"\x55"), origin.clone());
        let (ready_op, bytes, from, _event) = queue.pop_satisfiable().unwrap();
        assert_eq!(ready_op.token, Token(1));
        assert_eq!(&bytes[..], b"\x55");
        assert_eq!(from, origin);
    }
}
