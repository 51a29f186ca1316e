//! The authorization counter gating cancellable asynchronous operations.
//!
//! An authorization is an atomic lease count with an optional upper
//! bound. Acquire fails once cancelled or at the limit; release fails
//! when no lease is held; cancellation fails while leases are held.
//! A negative count encodes the cancelled state.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{Error, ErrorKind, Result};

/// A counter authorizing in-flight operations, with cooperative
/// cancellation.
#[derive(Debug)]
pub struct Authorization {
    count: AtomicI64,
    limit: Option<i64>,
}

impl Default for Authorization {
    fn default() -> Self {
        Self::new()
    }
}

impl Authorization {
    /// Create an authorization with no upper bound.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            limit: None,
        }
    }

    /// Create an authorization permitting at most `limit` simultaneous
    /// leases.
    #[must_use]
    pub const fn with_limit(limit: u32) -> Self {
        Self {
            count: AtomicI64::new(0),
            limit: Some(limit as i64),
        }
    }

    /// Acquire a lease. Fails with `CANCELLED` once the authorization
    /// has been cancelled and with `LIMIT` at the upper bound.
    pub fn acquire(&self) -> Result<()> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return Err(Error::new(ErrorKind::Cancelled));
            }
            if let Some(limit) = self.limit {
                if current >= limit {
                    return Err(Error::new(ErrorKind::Limit));
                }
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a previously acquired lease. Fails with `INVALID` when
    /// none is held.
    pub fn release(&self) -> Result<()> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return Err(Error::new(ErrorKind::Invalid));
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Cancel the authorization. Returns true when the idle counter
    /// transitioned to cancelled — no lease was acquired at the time.
    /// Returns false when a lease is still held or the authorization
    /// was already cancelled; nothing changes in either case.
    pub fn abort(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current != 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                -1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// True once the authorization has been cancelled.
    #[must_use]
    pub fn canceled(&self) -> bool {
        self.count.load(Ordering::Acquire) < 0
    }

    /// The current lease count; negative once cancelled.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Reset the authorization to its freshly constructed state.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trip() {
        let authorization = Authorization::new();
        assert_eq!(authorization.count(), 0);

        // Releasing with no lease held fails.
        assert_eq!(
            authorization.release().unwrap_err().kind(),
            ErrorKind::Invalid
        );
        assert_eq!(authorization.count(), 0);

        authorization.acquire().unwrap();
        assert_eq!(authorization.count(), 1);

        authorization.release().unwrap();
        assert_eq!(authorization.count(), 0);

        assert_eq!(
            authorization.release().unwrap_err().kind(),
            ErrorKind::Invalid
        );

        authorization.acquire().unwrap();
        authorization.acquire().unwrap();
        assert_eq!(authorization.count(), 2);
        authorization.release().unwrap();
        authorization.release().unwrap();
        assert_eq!(authorization.count(), 0);
    }

    #[test]
    fn abort_fails_while_leased() {
        let authorization = Authorization::new();

        authorization.acquire().unwrap();
        assert!(!authorization.abort());
        assert_eq!(authorization.count(), 1);
        assert!(!authorization.canceled());

        // The counter still works after the failed cancellation.
        authorization.acquire().unwrap();
        assert_eq!(authorization.count(), 2);
        authorization.release().unwrap();
        authorization.release().unwrap();
        assert_eq!(authorization.count(), 0);
    }

    #[test]
    fn limit_then_cancel() {
        let authorization = Authorization::with_limit(1);

        authorization.acquire().unwrap();
        assert_eq!(authorization.count(), 1);

        assert_eq!(
            authorization.acquire().unwrap_err().kind(),
            ErrorKind::Limit
        );
        assert_eq!(authorization.count(), 1);

        authorization.release().unwrap();
        assert_eq!(authorization.count(), 0);

        assert!(authorization.abort());
        assert_eq!(authorization.count(), -1);
        assert!(authorization.canceled());

        assert_eq!(
            authorization.acquire().unwrap_err().kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn cancel_then_acquire_fails() {
        let authorization = Authorization::new();
        assert!(authorization.abort());
        assert!(authorization.canceled());
        assert_eq!(
            authorization.acquire().unwrap_err().kind(),
            ErrorKind::Cancelled
        );

        // A second cancellation is a no-op.
        assert!(!authorization.abort());
        assert_eq!(authorization.count(), -1);

        authorization.reset();
        authorization.acquire().unwrap();
        assert_eq!(authorization.count(), 1);
    }
}
