//! The flow-control gate.
//!
//! A queue's effective interest composes four conditions: the user
//! wants the direction active, no rate-limit pause, no watermark
//! pause, and no shutdown. The gate tracks the conditions; applying
//! the composition to the multiplexer is the socket's job.

/// Which direction of traffic a flow-control change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlDirection {
    /// Sending only.
    Send,
    /// Receiving only.
    Receive,
    /// Both directions.
    Both,
}

impl FlowControlDirection {
    /// True if this direction covers sending.
    #[must_use]
    pub const fn covers_send(&self) -> bool {
        matches!(self, Self::Send | Self::Both)
    }

    /// True if this direction covers receiving.
    #[must_use]
    pub const fn covers_receive(&self) -> bool {
        matches!(self, Self::Receive | Self::Both)
    }
}

/// The pause conditions of one traffic direction.
#[derive(Debug, Clone, Copy)]
pub struct FlowControlGate {
    user: bool,
    rate_paused: bool,
    watermark_paused: bool,
    shutdown_paused: bool,
}

impl Default for FlowControlGate {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControlGate {
    /// Create a gate with traffic allowed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            user: true,
            rate_paused: false,
            watermark_paused: false,
            shutdown_paused: false,
        }
    }

    /// True when every condition allows traffic.
    #[must_use]
    pub const fn allows(&self) -> bool {
        self.user && !self.rate_paused && !self.watermark_paused && !self.shutdown_paused
    }

    /// Apply or relax user-requested flow control.
    pub fn set_user(&mut self, allowed: bool) {
        self.user = allowed;
    }

    /// Pause or resume for the rate limiter.
    pub fn set_rate_paused(&mut self, paused: bool) {
        self.rate_paused = paused;
    }

    /// Pause or resume for a watermark breach.
    pub fn set_watermark_paused(&mut self, paused: bool) {
        self.watermark_paused = paused;
    }

    /// Pause permanently for shutdown.
    pub fn set_shutdown_paused(&mut self, paused: bool) {
        self.shutdown_paused = paused;
    }
}

/// The result of re-evaluating flow control for a socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControlContext {
    /// Whether the socket should ask to be told about writability.
    pub enable_send: bool,
    /// Whether the socket should ask to be told about readability.
    pub enable_receive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_conditions_compose() {
        let mut gate = FlowControlGate::new();
        assert!(gate.allows());

        gate.set_user(false);
        assert!(!gate.allows());
        gate.set_user(true);
        assert!(gate.allows());

        gate.set_rate_paused(true);
        assert!(!gate.allows());
        gate.set_watermark_paused(true);
        gate.set_rate_paused(false);
        assert!(!gate.allows());
        gate.set_watermark_paused(false);
        assert!(gate.allows());

        gate.set_shutdown_paused(true);
        assert!(!gate.allows());
    }

    #[test]
    fn direction_coverage() {
        assert!(FlowControlDirection::Send.covers_send());
        assert!(!FlowControlDirection::Send.covers_receive());
        assert!(FlowControlDirection::Both.covers_send());
        assert!(FlowControlDirection::Both.covers_receive());
    }
}
