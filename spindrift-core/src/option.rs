//! Typed per-socket options.
//!
//! Each option is a tagged value; `get`/`set` on a descriptor operate on
//! one option at a time. Options the host platform cannot express are
//! reported as not implemented rather than silently ignored.

use std::fmt;
use std::time::Duration;

/// The linger behavior of a stream socket on close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Linger {
    /// Whether close blocks until pending data is flushed or discarded.
    pub enabled: bool,
    /// How long close may block.
    pub duration: Duration,
}

impl Linger {
    /// Create a new linger value.
    #[must_use]
    pub const fn new(enabled: bool, duration: Duration) -> Self {
        Self { enabled, duration }
    }
}

/// The name of a TCP congestion control algorithm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TcpCongestionControl {
    algorithm: String,
}

impl TcpCongestionControl {
    /// Create a congestion control value naming the specified `algorithm`.
    #[must_use]
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
        }
    }

    /// The algorithm name, e.g. `cubic` or `bbr`.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }
}

impl fmt::Display for TcpCongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.algorithm)
    }
}

/// A socket option and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocketOption {
    /// Allow binding to an address in TIME_WAIT.
    ReuseAddress(bool),
    /// Allow multiple sockets to bind the same address and port.
    ReusePort(bool),
    /// Periodically probe the peer to keep the connection alive.
    KeepAlive(bool),
    /// Disable Nagle's algorithm.
    NoDelay(bool),
    /// Block close until pending data is flushed or the timeout passes.
    Linger(Linger),
    /// The size of the OS send buffer, in bytes.
    SendBufferSize(usize),
    /// The size of the OS receive buffer, in bytes.
    ReceiveBufferSize(usize),
    /// The minimum number of bytes before the socket reports writable.
    SendLowWatermark(usize),
    /// The minimum number of bytes before the socket reports readable.
    ReceiveLowWatermark(usize),
    /// Permit sending to broadcast addresses.
    Broadcast(bool),
    /// Bypass the routing table and send directly to the interface.
    BypassRouting(bool),
    /// Deliver out-of-band data inline with ordinary data.
    InlineOutOfBand(bool),
    /// Report transmit timestamps on the notification queue.
    TxTimestamping(bool),
    /// Report receive timestamps on the notification queue.
    RxTimestamping(bool),
    /// Transmit user buffers without copying into the kernel.
    ZeroCopy(bool),
    /// Select the TCP congestion control algorithm.
    TcpCongestionControl(TcpCongestionControl),
}

impl SocketOption {
    /// The discriminant of this option.
    #[must_use]
    pub const fn kind(&self) -> SocketOptionKind {
        match self {
            Self::ReuseAddress(_) => SocketOptionKind::ReuseAddress,
            Self::ReusePort(_) => SocketOptionKind::ReusePort,
            Self::KeepAlive(_) => SocketOptionKind::KeepAlive,
            Self::NoDelay(_) => SocketOptionKind::NoDelay,
            Self::Linger(_) => SocketOptionKind::Linger,
            Self::SendBufferSize(_) => SocketOptionKind::SendBufferSize,
            Self::ReceiveBufferSize(_) => SocketOptionKind::ReceiveBufferSize,
            Self::SendLowWatermark(_) => SocketOptionKind::SendLowWatermark,
            Self::ReceiveLowWatermark(_) => SocketOptionKind::ReceiveLowWatermark,
            Self::Broadcast(_) => SocketOptionKind::Broadcast,
            Self::BypassRouting(_) => SocketOptionKind::BypassRouting,
            Self::InlineOutOfBand(_) => SocketOptionKind::InlineOutOfBand,
            Self::TxTimestamping(_) => SocketOptionKind::TxTimestamping,
            Self::RxTimestamping(_) => SocketOptionKind::RxTimestamping,
            Self::ZeroCopy(_) => SocketOptionKind::ZeroCopy,
            Self::TcpCongestionControl(_) => SocketOptionKind::TcpCongestionControl,
        }
    }
}

/// The discriminant of a [`SocketOption`], used to query option values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocketOptionKind {
    /// See [`SocketOption::ReuseAddress`].
    ReuseAddress,
    /// See [`SocketOption::ReusePort`].
    ReusePort,
    /// See [`SocketOption::KeepAlive`].
    KeepAlive,
    /// See [`SocketOption::NoDelay`].
    NoDelay,
    /// See [`SocketOption::Linger`].
    Linger,
    /// See [`SocketOption::SendBufferSize`].
    SendBufferSize,
    /// See [`SocketOption::ReceiveBufferSize`].
    ReceiveBufferSize,
    /// See [`SocketOption::SendLowWatermark`].
    SendLowWatermark,
    /// See [`SocketOption::ReceiveLowWatermark`].
    ReceiveLowWatermark,
    /// See [`SocketOption::Broadcast`].
    Broadcast,
    /// See [`SocketOption::BypassRouting`].
    BypassRouting,
    /// See [`SocketOption::InlineOutOfBand`].
    InlineOutOfBand,
    /// See [`SocketOption::TxTimestamping`].
    TxTimestamping,
    /// See [`SocketOption::RxTimestamping`].
    RxTimestamping,
    /// See [`SocketOption::ZeroCopy`].
    ZeroCopy,
    /// See [`SocketOption::TcpCongestionControl`].
    TcpCongestionControl,
}
