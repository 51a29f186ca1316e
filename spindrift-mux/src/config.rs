//! Engine configuration.

use std::time::Duration;

use spindrift_core::transport::TransportFamily;

/// How the scheduler places new sockets across workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalancing {
    /// Rotate across workers in order.
    #[default]
    RoundRobin,
    /// Pick the worker with the lowest attached load.
    LeastLoaded,
    /// Pin every socket to the specified worker.
    Pinned(usize),
}

/// Configuration of the embedded name resolver interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Whether resolution is offered at all.
    pub enabled: bool,
    /// Prefer addresses of this family when a name has several.
    pub prefer: TransportFamily,
    /// Give up on a resolution after this long.
    pub timeout: Option<Duration>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefer: TransportFamily::Undefined,
            timeout: None,
        }
    }
}

impl ResolverConfig {
    /// Create a resolver configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable resolution.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Prefer addresses of the specified family.
    #[must_use]
    pub fn with_preference(mut self, family: TransportFamily) -> Self {
        self.prefer = family;
        self
    }

    /// Set the resolution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Configuration of the engine: its workers, its multiplexers, and the
/// knobs of one wait/dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// The base name of worker threads.
    pub thread_name: String,
    /// The multiplexer driver, by name. Empty selects the default.
    pub driver_name: String,
    /// How many workers to run. Defaults to the number of CPUs.
    pub worker_count: Option<usize>,
    /// The most events one wait may deliver.
    pub max_events_per_wait: usize,
    /// The most timers one wake may fire.
    pub max_timers_per_wait: usize,
    /// How many dispatch cycles a worker runs per wait while work
    /// keeps arriving.
    pub max_cycles_per_wait: usize,
    /// Collect per-waiter counters.
    pub metrics_per_waiter: bool,
    /// Collect per-socket counters.
    pub metrics_per_socket: bool,
    /// The embedded resolver configuration.
    pub resolver: ResolverConfig,
    /// How new sockets are placed across workers.
    pub load_balancing: LoadBalancing,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_name: "spindrift".to_string(),
            driver_name: String::new(),
            worker_count: None,
            max_events_per_wait: 1024,
            max_timers_per_wait: 256,
            max_cycles_per_wait: 1,
            metrics_per_waiter: true,
            metrics_per_socket: false,
            resolver: ResolverConfig::default(),
            load_balancing: LoadBalancing::RoundRobin,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base name of worker threads.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Select the multiplexer driver by name.
    #[must_use]
    pub fn with_driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = name.into();
        self
    }

    /// Set the number of workers.
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Set the most events one wait may deliver.
    #[must_use]
    pub fn with_max_events_per_wait(mut self, count: usize) -> Self {
        self.max_events_per_wait = count;
        self
    }

    /// Set the most timers one wake may fire.
    #[must_use]
    pub fn with_max_timers_per_wait(mut self, count: usize) -> Self {
        self.max_timers_per_wait = count;
        self
    }

    /// Set how many dispatch cycles a worker runs per wait.
    #[must_use]
    pub fn with_max_cycles_per_wait(mut self, count: usize) -> Self {
        self.max_cycles_per_wait = count.max(1);
        self
    }

    /// Toggle per-waiter counters.
    #[must_use]
    pub fn with_metrics_per_waiter(mut self, enabled: bool) -> Self {
        self.metrics_per_waiter = enabled;
        self
    }

    /// Toggle per-socket counters.
    #[must_use]
    pub fn with_metrics_per_socket(mut self, enabled: bool) -> Self {
        self.metrics_per_socket = enabled;
        self
    }

    /// Set the embedded resolver configuration.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set the placement policy.
    #[must_use]
    pub fn with_load_balancing(mut self, policy: LoadBalancing) -> Self {
        self.load_balancing = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.thread_name, "spindrift");
        assert!(config.driver_name.is_empty());
        assert!(config.worker_count.is_none());
        assert_eq!(config.max_events_per_wait, 1024);
        assert_eq!(config.load_balancing, LoadBalancing::RoundRobin);
        assert!(config.resolver.enabled);
    }

    #[test]
    fn builder_style() {
        let config = EngineConfig::new()
            .with_thread_name("io")
            .with_driver_name("mio")
            .with_worker_count(2)
            .with_max_cycles_per_wait(0)
            .with_load_balancing(LoadBalancing::LeastLoaded);
        assert_eq!(config.thread_name, "io");
        assert_eq!(config.driver_name, "mio");
        assert_eq!(config.worker_count, Some(2));
        // Zero cycles would make no progress; the floor is one.
        assert_eq!(config.max_cycles_per_wait, 1);
        assert_eq!(config.load_balancing, LoadBalancing::LeastLoaded);
    }
}
