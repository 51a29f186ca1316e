//! Spindrift Core
//!
//! This crate contains the engine-agnostic building blocks:
//! - Error taxonomy shared by every layer (`error`)
//! - Transport tags and endpoint values (`transport`, `endpoint`)
//! - Typed socket options (`option`)
//! - The descriptor: an owned OS socket handle (`descriptor`)
//! - Operation options and result contexts (`ops`)
//! - Queue watermark bookkeeping (`watermark`)
//! - The authorization counter gating cancellable operations (`auth`)
//! - The dual-bucket rate limiter (`limiter`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod auth;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod limiter;
pub mod notification;
pub mod operation;
pub mod option;
pub mod transport;
pub mod watermark;

// A small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::auth::Authorization;
    pub use crate::descriptor::Descriptor;
    pub use crate::endpoint::{Endpoint, LocalEndpoint};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::limiter::{RateLimiter, RateLimiterConfig};
    pub use crate::notification::{Notification, Timestamp, TimestampKind, ZeroCopy};
    pub use crate::operation::{
        AcceptContext, AcceptOptions, ConnectContext, ConnectOptions, FileRange, ReceiveContext,
        ReceiveOptions, SendContext, SendOptions, SendPayload, ShutdownContext,
        ShutdownDirection, ShutdownOrigin, Token,
    };
    pub use crate::option::{SocketOption, SocketOptionKind};
    pub use crate::transport::{Transport, TransportFamily, TransportMode};
    pub use crate::watermark::Watermarks;
}
