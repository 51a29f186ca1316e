//! The two-phase detach coordinator.
//!
//! Every (multiplexer, socket) attachment carries one of these. A
//! worker acquires a processor lease before touching the socket's
//! state and releases it afterwards; detaching waits for the lease
//! count to reach zero before the handle may be closed. The whole
//! machine is one atomic word: the state in the low bits, the lease
//! count above it.

use std::sync::atomic::{AtomicU64, Ordering};

use spindrift_core::error::{Error, ErrorKind, Result};

const STATE_MASK: u64 = 0b11;
const STATE_ATTACHED: u64 = 0;
const STATE_DETACHING: u64 = 1;
const STATE_DETACHED: u64 = 2;
const COUNT_UNIT: u64 = 4;

/// The detach state of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachState {
    /// The socket is attached and may be dispatched.
    Attached,
    /// A detach was requested; leases are draining.
    Detaching,
    /// The socket is detached. Terminal.
    Detached,
}

/// The outcome of requesting a detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachProgress {
    /// No leases were held; the attachment is detached.
    Completed,
    /// Leases are still held; the final release completes the detach.
    Pending,
}

/// The atomic state machine coordinating dispatch and detachment.
#[derive(Debug, Default)]
pub struct DetachContext {
    word: AtomicU64,
}

impl DetachContext {
    /// Create a context in the attached state with no leases.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(STATE_ATTACHED),
        }
    }

    /// Acquire a processor lease. Granted only while attached.
    pub fn incr_processor(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            if word & STATE_MASK != STATE_ATTACHED {
                return false;
            }
            match self.word.compare_exchange_weak(
                word,
                word + COUNT_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => word = observed,
            }
        }
    }

    /// Release a processor lease. Returns true exactly when this
    /// release completed a pending detach; the caller then performs
    /// the final close and notifies the detach handler.
    pub fn decr_processor(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            debug_assert!(word >= COUNT_UNIT, "no processor lease held");
            let count = word >> 2;
            let state = word & STATE_MASK;
            let next = if count == 1 && state == STATE_DETACHING {
                STATE_DETACHED
            } else {
                word - COUNT_UNIT
            };
            match self
                .word
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == STATE_DETACHED && state == STATE_DETACHING,
                Err(observed) => word = observed,
            }
        }
    }

    /// Request a detach. Completes immediately when no lease is held,
    /// otherwise the final release completes it. A second request
    /// fails with `INVALID`.
    pub fn detach(&self) -> Result<DetachProgress> {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            if word & STATE_MASK != STATE_ATTACHED {
                return Err(Error::new(ErrorKind::Invalid));
            }
            let count = word >> 2;
            let next = if count == 0 {
                STATE_DETACHED
            } else {
                (count << 2) | STATE_DETACHING
            };
            match self
                .word
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Ok(if count == 0 {
                        DetachProgress::Completed
                    } else {
                        DetachProgress::Pending
                    });
                }
                Err(observed) => word = observed,
            }
        }
    }

    /// The current detach state.
    #[must_use]
    pub fn state(&self) -> DetachState {
        match self.word.load(Ordering::Acquire) & STATE_MASK {
            STATE_ATTACHED => DetachState::Attached,
            STATE_DETACHING => DetachState::Detaching,
            _ => DetachState::Detached,
        }
    }

    /// The number of processor leases currently held.
    #[must_use]
    pub fn processors(&self) -> u64 {
        self.word.load(Ordering::Acquire) >> 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn detach_without_leases_completes() {
        let context = DetachContext::new();
        assert_eq!(context.processors(), 0);
        assert_eq!(context.state(), DetachState::Attached);

        assert_eq!(context.detach().unwrap(), DetachProgress::Completed);
        assert_eq!(context.processors(), 0);
        assert_eq!(context.state(), DetachState::Detached);
    }

    #[test]
    fn lease_acquire_release() {
        let context = DetachContext::new();

        assert!(context.incr_processor());
        assert_eq!(context.processors(), 1);
        assert_eq!(context.state(), DetachState::Attached);

        assert!(!context.decr_processor());
        assert_eq!(context.processors(), 0);
        assert_eq!(context.state(), DetachState::Attached);

        assert_eq!(context.detach().unwrap(), DetachProgress::Completed);
        assert_eq!(context.state(), DetachState::Detached);
    }

    #[test]
    fn pending_detach_completed_by_release() {
        let context = DetachContext::new();

        assert!(context.incr_processor());
        assert_eq!(context.detach().unwrap(), DetachProgress::Pending);
        assert_eq!(context.state(), DetachState::Detaching);
        assert_eq!(context.processors(), 1);

        // No new lease may be granted while detaching.
        assert!(!context.incr_processor());

        assert!(context.decr_processor());
        assert_eq!(context.processors(), 0);
        assert_eq!(context.state(), DetachState::Detached);
    }

    #[test]
    fn second_detach_is_invalid() {
        let context = DetachContext::new();
        assert!(context.incr_processor());

        assert_eq!(context.detach().unwrap(), DetachProgress::Pending);
        assert_eq!(context.detach().unwrap_err().kind(), ErrorKind::Invalid);

        assert!(context.decr_processor());
        assert_eq!(context.detach().unwrap_err().kind(), ErrorKind::Invalid);
        assert!(!context.incr_processor());
    }

    #[test]
    fn nested_leases() {
        let context = DetachContext::new();

        assert!(context.incr_processor());
        assert!(context.incr_processor());
        assert_eq!(context.processors(), 2);

        assert!(!context.decr_processor());
        assert_eq!(context.processors(), 1);

        assert_eq!(context.detach().unwrap(), DetachProgress::Pending);
        assert!(context.decr_processor());
        assert_eq!(context.state(), DetachState::Detached);
    }

    #[test]
    fn concurrent_detach_yields_one_winner() {
        for _ in 0..100 {
            let context = Arc::new(DetachContext::new());
            assert!(context.incr_processor());

            let contenders: Vec<_> = (0..2)
                .map(|_| {
                    let context = Arc::clone(&context);
                    std::thread::spawn(move || context.detach())
                })
                .collect();

            let results: Vec<_> = contenders
                .into_iter()
                .map(|t| t.join().unwrap())
                .collect();

            let winners = results.iter().filter(|r| r.is_ok()).count();
            let losers = results
                .iter()
                .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::Invalid))
                .count();
            assert_eq!(winners, 1);
            assert_eq!(losers, 1);

            assert!(context.decr_processor());
            assert_eq!(context.state(), DetachState::Detached);
        }
    }
}
