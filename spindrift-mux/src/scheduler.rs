//! The scheduler: a pool of workers and a placement policy.
//!
//! Each worker drives its own reactor. New sockets are placed on a
//! reactor by the configured load-balancing policy; every attached
//! socket contributes weight to its reactor's load metric, which the
//! least-loaded policy consults.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spindrift_core::error::Result;

use crate::config::{EngineConfig, LoadBalancing};
use crate::reactor::Reactor;
use crate::worker::Worker;

/// A pool of workers distributing sockets across reactors.
pub struct Scheduler {
    workers: Vec<Worker>,
    policy: LoadBalancing,
    next: AtomicUsize,
}

impl Scheduler {
    /// Start the pool described by `config`.
    pub fn start(config: &EngineConfig) -> Result<Self> {
        let count = config.worker_count.unwrap_or_else(num_cpus::get).max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let reactor = Reactor::new(config)?;
            let name = format!("{}-{}", config.thread_name, index);
            workers.push(Worker::spawn(name, reactor, config.max_cycles_per_wait)?);
        }
        tracing::debug!(count, "scheduler started");
        Ok(Self {
            workers,
            policy: config.load_balancing,
            next: AtomicUsize::new(0),
        })
    }

    /// How many workers are running.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The reactor of the worker at `index`.
    #[must_use]
    pub fn reactor(&self, index: usize) -> &Arc<Reactor> {
        self.workers[index].reactor()
    }

    /// Pick a reactor for a new socket per the placement policy.
    #[must_use]
    pub fn place(&self) -> Arc<Reactor> {
        let index = match self.policy {
            LoadBalancing::RoundRobin => {
                self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len()
            }
            LoadBalancing::LeastLoaded => self
                .workers
                .iter()
                .enumerate()
                .min_by_key(|(_, worker)| worker.reactor().load())
                .map_or(0, |(index, _)| index),
            LoadBalancing::Pinned(index) => index % self.workers.len(),
        };
        Arc::clone(self.workers[index].reactor())
    }

    /// Stop every worker and wait for their threads.
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
