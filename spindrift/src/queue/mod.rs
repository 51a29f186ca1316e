//! Watermarked operation queues.
//!
//! The queue layer sits between the multiplexer and the user: pending
//! accepts, received bytes, and outgoing sends all wait here. Each
//! queue carries low/high watermarks whose crossings are edge-triggered
//! events, emitted exactly once per crossing per direction.

use std::fmt;

use spindrift_core::watermark::Watermarks;

pub mod accept;
pub mod read;
pub mod write;

pub use accept::{AcceptOp, AcceptQueue};
pub use read::{MessageQueue, ReadOp, ReadQueue, ReadReady};
pub use write::{WriteEntry, WriteQueue};

/// Which watermark a queue crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventKind {
    /// The queue drained down to its low watermark.
    LowWatermark,
    /// The queue grew to its high watermark.
    HighWatermark,
}

/// The queue's state at the moment of a crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueContext {
    /// The queue size when the event was generated.
    pub current: usize,
    /// The low watermark.
    pub low: usize,
    /// The high watermark.
    pub high: usize,
}

impl QueueContext {
    pub(crate) fn of(marks: &Watermarks) -> Self {
        Self {
            current: marks.current(),
            low: marks.low(),
            high: marks.high(),
        }
    }
}

/// An edge-triggered watermark crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEvent {
    /// Which watermark was crossed.
    pub kind: QueueEventKind,
    /// The queue's state at the crossing.
    pub context: QueueContext,
}

impl QueueEvent {
    pub(crate) fn high(marks: &Watermarks) -> Self {
        Self {
            kind: QueueEventKind::HighWatermark,
            context: QueueContext::of(marks),
        }
    }

    pub(crate) fn low(marks: &Watermarks) -> Self {
        Self {
            kind: QueueEventKind::LowWatermark,
            context: QueueContext::of(marks),
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            QueueEventKind::LowWatermark => "low watermark",
            QueueEventKind::HighWatermark => "high watermark",
        };
        write!(
            f,
            "{kind} (current: {}, low: {}, high: {})",
            self.context.current, self.context.low, self.context.high
        )
    }
}
