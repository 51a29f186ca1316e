//! The deadline-ordered timer queue.
//!
//! Timers are one-shot or periodic, fire in deadline order, and never
//! before their deadline. A worker passes `earliest_deadline - now` as
//! its wait timeout and calls [`TimerQueue::advance`] after each wake.
//! Cancellation after firing is a no-op reported as such; during a
//! concurrent fire the handler runs at most once.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::strand::Strand;

/// What a timer handler is told about a firing.
#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    /// The identity of the timer.
    pub id: u64,
    /// The deadline this firing honored.
    pub deadline: Instant,
}

/// A timer callback. Periodic timers fire it repeatedly.
pub type TimerHandler = Arc<dyn Fn(TimerEvent) + Send + Sync>;

/// The outcome of cancelling a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCancel {
    /// The timer was removed before firing.
    Canceled,
    /// The timer already fired (or was already cancelled).
    AlreadyFired,
}

struct TimerEntry {
    deadline: Instant,
    period: Option<Duration>,
    handler: TimerHandler,
    strand: Option<Arc<Strand>>,
}

#[derive(Default)]
struct TimerQueueInner {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

/// A deadline-ordered collection of timers.
#[derive(Default)]
pub struct TimerQueue {
    inner: Mutex<TimerQueueInner>,
}

/// A handle to a scheduled timer. Dropping the handle cancels a timer
/// that has not fired yet.
pub struct Timer {
    id: u64,
    queue: Weak<TimerQueue>,
}

impl Timer {
    /// The identity of the timer.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the timer if it has not fired.
    pub fn cancel(&self) -> TimerCancel {
        match self.queue.upgrade() {
            Some(queue) => queue.cancel_id(self.id),
            None => TimerCancel::AlreadyFired,
        }
    }

    /// Consume the handle without cancelling the timer.
    pub fn forget(mut self) {
        self.queue = Weak::new();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.cancel_id(self.id);
        }
    }
}

impl TimerQueue {
    /// Create an empty timer queue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Schedule a timer. One-shot timers de-register themselves when
    /// they fire; periodic timers re-arm by adding `period` to their
    /// deadline. With a `strand` the handler is posted there instead of
    /// running on the advancing thread.
    pub fn schedule(
        self: &Arc<Self>,
        deadline: Instant,
        period: Option<Duration>,
        handler: TimerHandler,
        strand: Option<Arc<Strand>>,
    ) -> Timer {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.insert(
            id,
            TimerEntry {
                deadline,
                period,
                handler,
                strand,
            },
        );
        inner.heap.push(Reverse((deadline, id)));
        Timer {
            id,
            queue: Arc::downgrade(self),
        }
    }

    fn cancel_id(&self, id: u64) -> TimerCancel {
        let mut inner = self.inner.lock();
        if inner.entries.remove(&id).is_some() {
            TimerCancel::Canceled
        } else {
            TimerCancel::AlreadyFired
        }
    }

    /// The deadline of the next timer to fire, if any.
    #[must_use]
    pub fn earliest_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        loop {
            let head = inner.heap.peek().copied()?;
            let Reverse((deadline, id)) = head;
            match inner.entries.get(&id) {
                // The heap slot is stale after a cancel or re-arm.
                Some(entry) if entry.deadline == deadline => return Some(deadline),
                _ => {
                    inner.heap.pop();
                }
            }
        }
    }

    /// Fire every timer due at `now`, in deadline order, up to
    /// `max_timers`. Returns how many fired.
    pub fn advance(&self, now: Instant, max_timers: usize) -> usize {
        let mut fired = 0;
        while fired < max_timers {
            let (event, handler, strand) = {
                let mut inner = self.inner.lock();
                let Some(&Reverse((deadline, id))) = inner.heap.peek() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                inner.heap.pop();
                let Some(entry) = inner.entries.get_mut(&id) else {
                    // Cancelled; the heap slot was stale.
                    continue;
                };
                if entry.deadline != deadline {
                    // Re-armed; a fresher heap slot exists.
                    continue;
                }
                let event = TimerEvent { id, deadline };
                let handler = Arc::clone(&entry.handler);
                let strand = entry.strand.clone();
                if let Some(period) = entry.period {
                    entry.deadline = deadline + period;
                    let next = entry.deadline;
                    inner.heap.push(Reverse((next, id)));
                } else {
                    inner.entries.remove(&id);
                }
                (event, handler, strand)
            };
            match strand {
                Some(strand) => {
                    strand.execute(Box::new(move || handler(event)));
                }
                None => handler(event),
            }
            fired += 1;
        }
        fired
    }

    /// How many timers are scheduled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if no timer is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
