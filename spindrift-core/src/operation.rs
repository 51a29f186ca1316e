//! Operation options and result contexts.
//!
//! Every queued operation carries a token and an optional absolute
//! deadline; completions report what actually happened through a
//! context value. Partial transfers are reported in the context and
//! are not errors.

use std::fs::File;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::endpoint::Endpoint;

/// A caller-assigned identifier for a queued operation.
///
/// Tokens name operations for cancellation. The engine also assigns
/// one to operations submitted without a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Token(pub u64);

impl Token {
    /// The reserved token meaning "none assigned".
    pub const NONE: Token = Token(0);
}

/// A range of an open file to transmit.
#[derive(Debug, Clone)]
pub struct FileRange {
    /// The file to read from.
    pub file: Arc<File>,
    /// The byte offset at which the range starts.
    pub offset: u64,
    /// The length of the range in bytes.
    pub len: u64,
}

/// The payload of a send operation.
#[derive(Debug, Clone)]
pub enum SendPayload {
    /// A single contiguous buffer.
    Bytes(Bytes),
    /// A scatter/gather array of buffers, sent in order.
    Slices(SmallVec<[Bytes; 4]>),
    /// A range of an open file.
    File(FileRange),
}

impl SendPayload {
    /// Total number of payload bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Slices(slices) => slices.iter().map(Bytes::len).sum(),
            Self::File(range) => range.len as usize,
        }
    }

    /// True if the payload carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for SendPayload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<Bytes>> for SendPayload {
    fn from(slices: Vec<Bytes>) -> Self {
        Self::Slices(SmallVec::from_vec(slices))
    }
}

/// Options controlling a send operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// The operation token, for cancellation.
    pub token: Option<Token>,
    /// The absolute deadline after which the send is cancelled.
    pub deadline: Option<Instant>,
}

impl SendOptions {
    /// Create send options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the operation token.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Set the absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Options controlling a receive operation.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    /// The maximum number of bytes to deliver.
    pub size: usize,
    /// The minimum number of bytes before the receive completes.
    pub min: usize,
    /// The operation token, for cancellation.
    pub token: Option<Token>,
    /// The absolute deadline after which the receive is cancelled.
    pub deadline: Option<Instant>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            size: usize::MAX,
            min: 1,
            token: None,
            deadline: None,
        }
    }
}

impl ReceiveOptions {
    /// Create receive options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of bytes to deliver.
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the minimum number of bytes before the receive completes.
    #[must_use]
    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    /// Set the operation token.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Set the absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Options controlling an accept operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptOptions {
    /// The operation token, for cancellation.
    pub token: Option<Token>,
    /// The absolute deadline after which the accept is cancelled.
    pub deadline: Option<Instant>,
}

impl AcceptOptions {
    /// Create accept options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the operation token.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Set the absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Options controlling a connect operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// The operation token, for cancellation.
    pub token: Option<Token>,
    /// The absolute deadline after which the connect is cancelled.
    pub deadline: Option<Instant>,
}

impl ConnectOptions {
    /// Create connect options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the operation token.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Set the absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The result of a send operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendContext {
    /// The token assigned to the operation.
    pub token: Token,
    /// How many payload bytes were handed to the OS.
    pub bytes_transferred: usize,
}

/// The result of a receive operation.
#[derive(Debug, Clone, Default)]
pub struct ReceiveContext {
    /// The token assigned to the operation.
    pub token: Token,
    /// How many bytes were delivered.
    pub bytes_transferred: usize,
    /// The peer that sent the data, for datagram receives.
    pub endpoint: Option<Endpoint>,
}

/// The result of a connect operation.
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
    /// The token assigned to the operation.
    pub token: Token,
    /// The local endpoint after the connection was established.
    pub source_endpoint: Option<Endpoint>,
    /// The remote endpoint after the connection was established.
    pub remote_endpoint: Option<Endpoint>,
    /// How many attempts the connect made.
    pub attempts: u32,
}

/// The result of an accept operation.
#[derive(Debug, Clone, Default)]
pub struct AcceptContext {
    /// The token assigned to the operation.
    pub token: Token,
    /// The remote endpoint of the accepted connection.
    pub remote_endpoint: Option<Endpoint>,
}

/// Which direction of a socket to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    /// Stop sending; the peer observes end-of-file.
    Send,
    /// Stop receiving; further arrivals are discarded.
    Receive,
    /// Shut down both directions.
    Both,
}

/// Which side initiated a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOrigin {
    /// This socket initiated the shutdown.
    Source,
    /// The peer initiated the shutdown.
    Remote,
}

/// What a shutdown sequence actually shut down.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownContext {
    /// Which side initiated the shutdown.
    pub origin: ShutdownOrigin,
    /// True if the send direction was shut down.
    pub send: bool,
    /// True if the receive direction was shut down.
    pub receive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_length() {
        let payload = SendPayload::from(Bytes::from_static(b"abc"));
        assert_eq!(payload.len(), 3);
        assert!(!payload.is_empty());

        let payload = SendPayload::from(vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b""),
            Bytes::from_static(b"cde"),
        ]);
        assert_eq!(payload.len(), 5);
    }

    #[test]
    fn receive_options_defaults() {
        let options = ReceiveOptions::new();
        assert_eq!(options.min, 1);
        assert_eq!(options.size, usize::MAX);
        assert!(options.token.is_none());
        assert!(options.deadline.is_none());
    }

    #[test]
    fn builder_style() {
        let deadline = Instant::now();
        let options = SendOptions::new()
            .with_token(Token(7))
            .with_deadline(deadline);
        assert_eq!(options.token, Some(Token(7)));
        assert_eq!(options.deadline, Some(deadline));
    }
}
