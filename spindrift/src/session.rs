//! Transport security and payload compression interfaces.
//!
//! The codec implementations live outside this crate; sockets only
//! know these seams. An upgraded stream socket pipes outbound bytes
//! through compression then encryption, and inbound bytes through
//! decryption then decompression. Sessions own any framing they need.

use std::time::Instant;

use bytes::Bytes;

use spindrift_core::error::Result;
use spindrift_core::operation::Token;

/// A transport-layer encryption session.
pub trait EncryptionSession: Send + Sync {
    /// Protect outbound bytes.
    fn encode(&self, plaintext: Bytes) -> Result<Bytes>;

    /// Recover inbound bytes.
    fn decode(&self, ciphertext: Bytes) -> Result<Bytes>;

    /// The authenticated identity of the peer, once established.
    fn peer_identity(&self) -> Option<String> {
        None
    }
}

/// A payload compression codec.
pub trait CompressionCodec: Send + Sync {
    /// Compress outbound bytes.
    fn deflate(&self, data: Bytes) -> Result<Bytes>;

    /// Decompress inbound bytes.
    fn inflate(&self, data: Bytes) -> Result<Bytes>;
}

/// Options controlling an upgrade into an encryption session.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpgradeOptions {
    /// The operation token.
    pub token: Option<Token>,
    /// The absolute deadline for the upgrade.
    pub deadline: Option<Instant>,
}

impl UpgradeOptions {
    /// Create upgrade options with default values.
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

/// Options controlling a downgrade out of an encryption session.
#[derive(Debug, Clone, Copy, Default)]
pub struct DowngradeOptions {
    /// Abort without flushing the session's final bytes.
    pub abortive: bool,
}

impl DowngradeOptions {
    /// Create downgrade options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort without flushing.
    #[must_use]
    pub fn with_abortive(mut self, abortive: bool) -> Self {
        self.abortive = abortive;
        self
    }
}
