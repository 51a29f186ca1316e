//! The engine: the front object of the framework.
//!
//! An engine owns a scheduler full of workers and creates sockets
//! placed across their reactors by the configured load-balancing
//! policy. Dropping the engine (or calling [`Engine::shutdown`]) stops
//! the workers; sockets must be detached first.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use spindrift_core::error::{Error, ErrorKind, Result};
use spindrift_mux::config::EngineConfig;
use spindrift_mux::reactor::Reactor;
use spindrift_mux::scheduler::Scheduler;
use spindrift_mux::strand::Strand;
use spindrift_mux::timer::{Timer, TimerHandler};

use crate::resolver::{Resolve, SystemResolver};
use crate::socket::listener::AcceptFactory;
use crate::socket::{
    DatagramSocket, DatagramSocketOptions, ListenerSocket, ListenerSocketOptions, StreamSocket,
    StreamSocketOptions,
};

/// The front object: workers, placement, socket creation.
pub struct Engine {
    scheduler: Mutex<Option<Scheduler>>,
    config: EngineConfig,
    resolver: Arc<dyn Resolve>,
    weak_self: Mutex<Weak<Engine>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Start an engine configured by `config`.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let scheduler = Scheduler::start(&config)?;
        let resolver: Arc<dyn Resolve> =
            Arc::new(SystemResolver::new(config.resolver.clone()));
        let engine = Arc::new(Self {
            scheduler: Mutex::new(Some(scheduler)),
            config,
            resolver,
            weak_self: Mutex::new(Weak::new()),
        });
        *engine.weak_self.lock() = Arc::downgrade(&engine);
        tracing::debug!("engine started");
        Ok(engine)
    }

    /// Start an engine with default configuration.
    pub fn create_default() -> Result<Arc<Self>> {
        Self::new(EngineConfig::default())
    }

    /// The engine's configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The engine's name resolver.
    #[must_use]
    pub fn resolver(&self) -> &Arc<dyn Resolve> {
        &self.resolver
    }

    /// How many workers are running.
    pub fn worker_count(&self) -> usize {
        self.scheduler
            .lock()
            .as_ref()
            .map_or(0, Scheduler::worker_count)
    }

    fn place(&self) -> Result<Arc<Reactor>> {
        self.scheduler
            .lock()
            .as_ref()
            .map(Scheduler::place)
            .ok_or(Error::new(ErrorKind::Invalid))
    }

    /// Create a stream socket placed by the load-balancing policy.
    pub fn create_stream_socket(
        &self,
        options: StreamSocketOptions,
    ) -> Result<Arc<StreamSocket>> {
        let reactor = self.place()?;
        StreamSocket::create(reactor, options)
    }

    /// Create a datagram socket placed by the load-balancing policy.
    pub fn create_datagram_socket(
        &self,
        options: &DatagramSocketOptions,
    ) -> Result<Arc<DatagramSocket>> {
        let reactor = self.place()?;
        DatagramSocket::create(reactor, options)
    }

    /// Create a listener socket placed by the load-balancing policy.
    /// Accepted connections become stream sockets placed by the same
    /// policy.
    pub fn create_listener_socket(
        &self,
        options: &ListenerSocketOptions,
    ) -> Result<Arc<ListenerSocket>> {
        let reactor = self.place()?;
        let engine = self.weak_self.lock().clone();
        let stream_options = options
            .stream_options
            .clone()
            .with_transport(options.transport);
        let factory: AcceptFactory = Box::new(move |descriptor| {
            let engine = engine.upgrade().ok_or(Error::new(ErrorKind::Invalid))?;
            let reactor = engine.place()?;
            StreamSocket::adopt(reactor, descriptor, stream_options.clone())
        });
        ListenerSocket::create(reactor, options, factory)
    }

    /// Schedule a timer on one of the engine's reactors.
    pub fn schedule_timer(
        &self,
        deadline: Instant,
        period: Option<Duration>,
        handler: TimerHandler,
        strand: Option<Arc<Strand>>,
    ) -> Result<Timer> {
        let reactor = self.place()?;
        Ok(reactor.schedule_timer(deadline, period, handler, strand))
    }

    /// Stop the workers and wait for their threads. Idempotent.
    pub fn shutdown(&self) {
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
            tracing::debug!("engine stopped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindrift_mux::config::LoadBalancing;

    #[test]
    fn engine_starts_and_stops() {
        let engine = Engine::new(EngineConfig::new().with_worker_count(2)).unwrap();
        assert_eq!(engine.worker_count(), 2);
        engine.shutdown();
        assert_eq!(engine.worker_count(), 0);

        // Creating sockets after shutdown fails cleanly.
        assert!(engine
            .create_stream_socket(StreamSocketOptions::default())
            .is_err());
    }

    #[test]
    fn sockets_are_placed_across_workers() {
        let engine = Engine::new(
            EngineConfig::new()
                .with_worker_count(2)
                .with_load_balancing(LoadBalancing::RoundRobin),
        )
        .unwrap();

        let first = engine
            .create_datagram_socket(&DatagramSocketOptions::default())
            .unwrap();
        let second = engine
            .create_datagram_socket(&DatagramSocketOptions::default())
            .unwrap();
        let _ = (first, second);
        engine.shutdown();
    }
}
