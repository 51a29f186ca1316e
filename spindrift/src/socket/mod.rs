//! User-visible sockets: stream, datagram, and listener.
//!
//! Sockets compose a multiplexer registration with the watermarked
//! operation queues. Users submit operations with callbacks; the
//! socket adjusts its readiness interest, translates events into
//! progress on the queues, and invokes completions on a per-socket
//! serialization strand (or, for sends, on the send's own strand).

use std::sync::Arc;

use bytes::Bytes;

use spindrift_core::error::Result;
use spindrift_core::limiter::RateLimiterConfig;
use spindrift_core::operation::{
    AcceptContext, ConnectContext, ReceiveContext, SendContext,
};
use spindrift_core::transport::Transport;

pub mod datagram;
pub mod listener;
pub mod stream;

pub use datagram::DatagramSocket;
pub use listener::ListenerSocket;
pub use stream::StreamSocket;

/// Completion handler of a send.
pub type SendCallback = Box<dyn FnOnce(Result<SendContext>) + Send>;

/// Completion handler of a receive.
pub type ReceiveCallback = Box<dyn FnOnce(Result<(Bytes, ReceiveContext)>) + Send>;

/// Completion handler of a connect.
pub type ConnectCallback = Box<dyn FnOnce(Result<ConnectContext>) + Send>;

/// Completion handler of an accept.
pub type AcceptCallback = Box<dyn FnOnce(Result<(Arc<StreamSocket>, AcceptContext)>) + Send>;

/// Completion handler of an upgrade.
pub type UpgradeCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Notification that a socket finished detaching.
pub type DetachCallback = Box<dyn FnOnce() + Send>;

/// Default high watermark of byte-addressed queues.
pub(crate) const DEFAULT_QUEUE_HIGH_WATERMARK: usize = 64 * 1024;

/// Default size of the chunk copied from the OS receive buffer.
pub(crate) const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Configuration of a stream socket's queues and pacing.
#[derive(Clone)]
pub struct StreamSocketOptions {
    /// The socket's transport.
    pub transport: Transport,
    /// Read queue low watermark (bytes).
    pub read_queue_low_watermark: usize,
    /// Read queue high watermark (bytes).
    pub read_queue_high_watermark: usize,
    /// Write queue low watermark (bytes).
    pub write_queue_low_watermark: usize,
    /// Write queue high watermark (bytes).
    pub write_queue_high_watermark: usize,
    /// Size of the chunk copied per read from the OS buffer.
    pub read_buffer_size: usize,
    /// Pace transmission with a rate limiter.
    pub rate_limiter: Option<RateLimiterConfig>,
}

impl Default for StreamSocketOptions {
    fn default() -> Self {
        Self {
            transport: Transport::TcpIpv4,
            read_queue_low_watermark: 0,
            read_queue_high_watermark: DEFAULT_QUEUE_HIGH_WATERMARK,
            write_queue_low_watermark: 0,
            write_queue_high_watermark: DEFAULT_QUEUE_HIGH_WATERMARK,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            rate_limiter: None,
        }
    }
}

impl StreamSocketOptions {
    /// Create stream socket options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the read queue watermarks.
    #[must_use]
    pub fn with_read_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.read_queue_low_watermark = low;
        self.read_queue_high_watermark = high;
        self
    }

    /// Set the write queue watermarks.
    #[must_use]
    pub fn with_write_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.write_queue_low_watermark = low;
        self.write_queue_high_watermark = high;
        self
    }

    /// Set the read chunk size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Pace transmission with the specified rate limiter.
    #[must_use]
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }
}

/// Configuration of a datagram socket's queues and pacing.
#[derive(Clone)]
pub struct DatagramSocketOptions {
    /// The socket's transport.
    pub transport: Transport,
    /// Read queue low watermark (bytes).
    pub read_queue_low_watermark: usize,
    /// Read queue high watermark (bytes).
    pub read_queue_high_watermark: usize,
    /// Write queue low watermark (bytes).
    pub write_queue_low_watermark: usize,
    /// Write queue high watermark (bytes).
    pub write_queue_high_watermark: usize,
    /// The largest datagram the socket will receive.
    pub max_datagram_size: usize,
    /// Pace transmission with a rate limiter.
    pub rate_limiter: Option<RateLimiterConfig>,
}

impl Default for DatagramSocketOptions {
    fn default() -> Self {
        Self {
            transport: Transport::UdpIpv4,
            read_queue_low_watermark: 0,
            read_queue_high_watermark: DEFAULT_QUEUE_HIGH_WATERMARK,
            write_queue_low_watermark: 0,
            write_queue_high_watermark: DEFAULT_QUEUE_HIGH_WATERMARK,
            max_datagram_size: 65536,
            rate_limiter: None,
        }
    }
}

impl DatagramSocketOptions {
    /// Create datagram socket options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the read queue watermarks.
    #[must_use]
    pub fn with_read_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.read_queue_low_watermark = low;
        self.read_queue_high_watermark = high;
        self
    }

    /// Set the write queue watermarks.
    #[must_use]
    pub fn with_write_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.write_queue_low_watermark = low;
        self.write_queue_high_watermark = high;
        self
    }

    /// Set the largest datagram the socket will receive.
    #[must_use]
    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    /// Pace transmission with the specified rate limiter.
    #[must_use]
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }
}

/// Configuration of a listener socket and the stream sockets it
/// produces.
#[derive(Clone)]
pub struct ListenerSocketOptions {
    /// The listener's transport.
    pub transport: Transport,
    /// Accept queue low watermark (connections).
    pub accept_queue_low_watermark: usize,
    /// Accept queue high watermark (connections).
    pub accept_queue_high_watermark: usize,
    /// Options applied to accepted stream sockets.
    pub stream_options: StreamSocketOptions,
}

impl Default for ListenerSocketOptions {
    fn default() -> Self {
        Self {
            transport: Transport::TcpIpv4,
            accept_queue_low_watermark: 0,
            accept_queue_high_watermark: 128,
            stream_options: StreamSocketOptions::default(),
        }
    }
}

impl ListenerSocketOptions {
    /// Create listener socket options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the accept queue watermarks.
    #[must_use]
    pub fn with_accept_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.accept_queue_low_watermark = low;
        self.accept_queue_high_watermark = high;
        self
    }

    /// Set the options applied to accepted stream sockets.
    #[must_use]
    pub fn with_stream_options(mut self, options: StreamSocketOptions) -> Self {
        self.stream_options = options;
        self
    }
}
