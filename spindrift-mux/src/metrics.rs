//! The counters the engine maintains.
//!
//! Plain atomics, toggled by configuration. Anything beyond these
//! counters is the business of an external metrics system.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters for one multiplexer.
#[derive(Debug, Default)]
pub struct Metrics {
    enabled: bool,
    wakeups: AtomicU64,
    events_dispatched: AtomicU64,
    timers_fired: AtomicU64,
    functions_executed: AtomicU64,
    sockets_attached: AtomicI64,
}

/// A point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// How many times a wait returned.
    pub wakeups: u64,
    /// How many socket events were dispatched.
    pub events_dispatched: u64,
    /// How many timers fired.
    pub timers_fired: u64,
    /// How many deferred functions ran.
    pub functions_executed: u64,
    /// How many sockets are currently attached.
    pub sockets_attached: i64,
}

impl Metrics {
    /// Create counters; disabled counters stay zero.
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            wakeups: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            timers_fired: AtomicU64::new(0),
            functions_executed: AtomicU64::new(0),
            sockets_attached: AtomicI64::new(0),
        }
    }

    /// True if collection is enabled.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record one wait returning.
    pub fn record_wakeup(&self) {
        if self.enabled {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record `count` dispatched socket events.
    pub fn record_events(&self, count: u64) {
        if self.enabled {
            self.events_dispatched.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Record `count` fired timers.
    pub fn record_timers(&self, count: u64) {
        if self.enabled {
            self.timers_fired.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Record `count` executed deferred functions.
    pub fn record_functions(&self, count: u64) {
        if self.enabled {
            self.functions_executed.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Record a socket attaching or detaching.
    pub fn record_socket(&self, attached: bool) {
        if self.enabled {
            let delta = if attached { 1 } else { -1 };
            self.sockets_attached.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// A point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            wakeups: self.wakeups.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            functions_executed: self.functions_executed.load(Ordering::Relaxed),
            sockets_attached: self.sockets_attached.load(Ordering::Relaxed),
        }
    }
}
