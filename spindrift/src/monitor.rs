//! Socket lifecycle monitoring.
//!
//! Every socket feeds an event stream tracking its lifecycle and its
//! queue watermark crossings. The stream is a channel receiver; drop
//! it to ignore events.

use std::fmt;

use spindrift_core::endpoint::Endpoint;
use spindrift_core::error::Error;
use spindrift_core::operation::ShutdownContext;

use crate::queue::QueueEvent;

/// Socket lifecycle and queue events.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The socket was bound to an endpoint.
    Bound(Endpoint),
    /// The listener started listening.
    Listening(Endpoint),
    /// The listener accepted a connection from a peer.
    Accepted(Endpoint),
    /// The socket connected to a peer.
    Connected(Endpoint),
    /// The connection is gone, with the error that ended it, if any.
    Disconnected {
        /// The peer, when it was still known.
        endpoint: Option<Endpoint>,
        /// The terminal error, absent for an orderly shutdown.
        error: Option<Error>,
    },
    /// A shutdown sequence completed.
    ShutdownComplete(ShutdownContext),
    /// The read queue crossed a watermark.
    ReadQueue(QueueEvent),
    /// The write queue crossed a watermark.
    WriteQueue(QueueEvent),
    /// The accept queue crossed a watermark.
    AcceptQueue(QueueEvent),
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound(endpoint) => write!(f, "bound to {endpoint}"),
            Self::Listening(endpoint) => write!(f, "listening on {endpoint}"),
            Self::Accepted(endpoint) => write!(f, "accepted connection from {endpoint}"),
            Self::Connected(endpoint) => write!(f, "connected to {endpoint}"),
            Self::Disconnected {
                endpoint,
                error: Some(error),
            } => match endpoint {
                Some(endpoint) => write!(f, "disconnected from {endpoint}: {error}"),
                None => write!(f, "disconnected: {error}"),
            },
            Self::Disconnected { endpoint, .. } => match endpoint {
                Some(endpoint) => write!(f, "disconnected from {endpoint}"),
                None => write!(f, "disconnected"),
            },
            Self::ShutdownComplete(context) => {
                write!(
                    f,
                    "shutdown complete (send: {}, receive: {})",
                    context.send, context.receive
                )
            }
            Self::ReadQueue(event) => write!(f, "read queue {event}"),
            Self::WriteQueue(event) => write!(f, "write queue {event}"),
            Self::AcceptQueue(event) => write!(f, "accept queue {event}"),
        }
    }
}

/// The receiving end of a socket's event stream.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// The sending end of a socket's event stream.
pub(crate) type SocketEventSender = flume::Sender<SocketEvent>;

/// Create a monitoring channel pair.
pub(crate) fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}
