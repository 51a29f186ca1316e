//! Readiness interests and poll events.

use std::fmt;

/// The set of readiness conditions a socket is interested in.
///
/// Error conditions are always reported and are not part of the set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    /// The empty interest set.
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };

    /// Interest in readability.
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    /// Interest in writability.
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    /// True if the set contains readability.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.readable
    }

    /// True if the set contains writability.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// True if the set is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }

    /// This set with readability included or removed.
    #[must_use]
    pub const fn readable(mut self, value: bool) -> Self {
        self.readable = value;
        self
    }

    /// This set with writability included or removed.
    #[must_use]
    pub const fn writable(mut self, value: bool) -> Self {
        self.writable = value;
        self
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.readable, self.writable) {
            (true, true) => f.write_str("readable|writable"),
            (true, false) => f.write_str("readable"),
            (false, true) => f.write_str("writable"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// One readiness event observed by a driver.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    /// The registration token the event belongs to.
    pub token: usize,
    /// The socket is readable.
    pub readable: bool,
    /// The socket is writable.
    pub writable: bool,
    /// The socket has a pending error condition.
    pub error: bool,
    /// The peer closed its send direction.
    pub read_closed: bool,
    /// The local send direction is closed.
    pub write_closed: bool,
}

impl PollEvent {
    /// An event for `token` with no conditions set.
    #[must_use]
    pub const fn empty(token: usize) -> Self {
        Self {
            token,
            readable: false,
            writable: false,
            error: false,
            read_closed: false,
            write_closed: false,
        }
    }
}
