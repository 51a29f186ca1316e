//! # Spindrift
//!
//! A cross-platform asynchronous networking framework: blocking and
//! non-blocking datagram, stream, and listener sockets over pluggable
//! I/O multiplexers, with timers, name resolution interfaces, and
//! watermark-governed operation pipelines.
//!
//! ## Architecture
//!
//! The workspace is layered:
//!
//! - **`spindrift-core`**: value types and the descriptor — errors,
//!   transports, endpoints, socket options, operation records,
//!   watermarks, the authorization counter, the rate limiter
//! - **`spindrift-mux`**: the engine — the pluggable driver, reactor,
//!   proactor, detach coordinator, timers, strands, workers
//! - **`spindrift`**: this crate — user-visible sockets, their queues,
//!   and the `Engine` front object
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use spindrift::prelude::*;
//!
//! # fn example() -> spindrift::Result<()> {
//! let engine = Engine::new(EngineConfig::new().with_worker_count(2))?;
//!
//! let listener = engine.create_listener_socket(&ListenerSocketOptions::new())?;
//! listener.bind(&Endpoint::parse("127.0.0.1:0")?, false)?;
//! listener.listen(128)?;
//!
//! listener.accept(AcceptOptions::new(), Box::new(|result| {
//!     if let Ok((stream, context)) = result {
//!         println!("accepted {:?}", context.remote_endpoint);
//!         let _ = stream;
//!     }
//! }))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Worker threads each drive one multiplexer in a wait/dispatch loop.
//! Per-socket dispatch is serialized by a processor lease; user
//! completions run on a per-socket strand and must not block the
//! worker. Detachment is a two-phase barrier: pending dispatches drain
//! before the OS handle is closed, and the detach callback runs last.

#![warn(missing_docs)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

pub mod engine;
pub mod flow;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod socket;

// Re-export the layers beneath the facade.
pub use bytes::Bytes;
pub use spindrift_core::auth::Authorization;
pub use spindrift_core::descriptor::Descriptor;
pub use spindrift_core::endpoint::{Endpoint, LocalEndpoint};
pub use spindrift_core::error::{Error, ErrorKind, Result};
pub use spindrift_core::limiter::{RateLimiter, RateLimiterConfig, RateLimiterDecision};
pub use spindrift_core::notification::{Notification, Timestamp, TimestampKind, ZeroCopy};
pub use spindrift_core::operation::{
    AcceptContext, AcceptOptions, ConnectContext, ConnectOptions, FileRange, ReceiveContext,
    ReceiveOptions, SendContext, SendOptions, SendPayload, ShutdownContext, ShutdownDirection,
    ShutdownOrigin, Token,
};
pub use spindrift_core::option::{Linger, SocketOption, SocketOptionKind, TcpCongestionControl};
pub use spindrift_core::transport::{Transport, TransportFamily, TransportMode};
pub use spindrift_core::watermark::Watermarks;
pub use spindrift_mux::config::{EngineConfig, LoadBalancing, ResolverConfig};
pub use spindrift_mux::detach::{DetachContext, DetachProgress, DetachState};
pub use spindrift_mux::proactor::{Completion, Proactor, ProactorSocket};
pub use spindrift_mux::reactor::{Reactor, ReactorSocket};
pub use spindrift_mux::strand::{Executor, Strand};
pub use spindrift_mux::timer::{Timer, TimerCancel, TimerEvent, TimerQueue};

pub use engine::Engine;
pub use monitor::{SocketEvent, SocketMonitor};
pub use socket::{
    DatagramSocket, DatagramSocketOptions, ListenerSocket, ListenerSocketOptions, StreamSocket,
    StreamSocketOptions,
};

/// The things almost every user of the crate needs.
pub mod prelude {
    pub use crate::engine::Engine;
    pub use crate::flow::FlowControlDirection;
    pub use crate::monitor::{SocketEvent, SocketMonitor};
    pub use crate::queue::{QueueEvent, QueueEventKind};
    pub use crate::session::{CompressionCodec, EncryptionSession, UpgradeOptions};
    pub use crate::socket::{
        DatagramSocket, DatagramSocketOptions, ListenerSocket, ListenerSocketOptions,
        StreamSocket, StreamSocketOptions,
    };
    pub use bytes::Bytes;
    pub use spindrift_core::prelude::*;
    pub use spindrift_mux::config::{EngineConfig, LoadBalancing};
}

/// Development helper: initialize a tracing subscriber when `RUST_LOG`
/// is set.
///
/// Tests and examples call `spindrift::dev_tracing::init_tracing()` to
/// enable structured logging for debugging. This is a no-op when
/// `RUST_LOG` is not set or a global subscriber is already installed.
pub mod dev_tracing {
    /// Best-effort: install a fmt subscriber from the env filter.
    pub fn init_tracing() {
        if std::env::var("RUST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        }
    }
}
