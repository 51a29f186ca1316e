//! Notifications reported on a socket's error queue.
//!
//! When transmit/receive timestamping or zero-copy transmission is
//! enabled, the OS reports progress out of band. The engine drains
//! these into typed notifications delivered on the socket's
//! notification queue.

use std::time::SystemTime;

/// When in its life a timestamped packet was stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampKind {
    /// The packet left the transmit queue.
    Scheduled,
    /// The packet left the host.
    Sent,
    /// The peer acknowledged the packet.
    Acknowledged,
}

/// A packet timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// What the timestamp marks.
    pub kind: TimestampKind,
    /// The identifier correlating the timestamp with its send.
    pub id: u32,
    /// When the event happened.
    pub time: SystemTime,
}

/// The result of a zero-copy transmission range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroCopy {
    /// The first send covered by this notification.
    pub from: u32,
    /// The last send covered by this notification.
    pub to: u32,
    /// True when the OS fell back to copying the range.
    pub copied: bool,
}

/// One entry drained from a socket's error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Notification {
    /// A packet timestamp.
    Timestamp(Timestamp),
    /// A zero-copy transmission result.
    ZeroCopy(ZeroCopy),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_values() {
        let timestamp = Timestamp {
            kind: TimestampKind::Sent,
            id: 7,
            time: SystemTime::UNIX_EPOCH,
        };
        let notification = Notification::Timestamp(timestamp);
        assert_eq!(notification, Notification::Timestamp(timestamp));

        let zero_copy = ZeroCopy {
            from: 0,
            to: 3,
            copied: false,
        };
        assert_ne!(
            Notification::ZeroCopy(zero_copy),
            Notification::Timestamp(timestamp)
        );
    }
}
