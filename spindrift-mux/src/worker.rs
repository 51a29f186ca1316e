//! Worker threads.
//!
//! One thread per worker, each bound to one reactor, looping over
//! wait/dispatch cycles until stopped. The wait timeout is bounded by
//! the reactor's earliest timer deadline; a stop request interrupts
//! the controller so a blocked wait returns promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use spindrift_core::error::{Error, ErrorKind, Result};

use crate::reactor::Reactor;

/// A thread driving one reactor.
pub struct Worker {
    reactor: Arc<Reactor>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker named `name` driving `reactor`. The worker runs
    /// up to `max_cycles_per_wait` extra non-blocking cycles after a
    /// wait that produced work.
    pub fn spawn(
        name: impl Into<String>,
        reactor: Arc<Reactor>,
        max_cycles_per_wait: usize,
    ) -> Result<Self> {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_reactor = Arc::clone(&reactor);
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::debug!(worker = %name, "worker started");
                while !thread_stop.load(Ordering::Acquire) {
                    match thread_reactor.run_once(None) {
                        Ok(0) => continue,
                        Ok(_) => {
                            // Work arrived; spin a few bounded extra
                            // cycles before blocking again.
                            for _ in 1..max_cycles_per_wait {
                                if thread_stop.load(Ordering::Acquire) {
                                    break;
                                }
                                match thread_reactor.run_once(Some(Duration::ZERO)) {
                                    Ok(0) => break,
                                    Ok(_) => continue,
                                    Err(err) => {
                                        tracing::warn!(worker = %name, error = %err, "cycle failed");
                                        break;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(worker = %name, error = %err, "wait failed");
                            std::thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
                tracing::debug!(worker = %name, "worker stopped");
            })
            .map_err(|_| Error::new(ErrorKind::Unknown))?;

        Ok(Self {
            reactor,
            stop,
            thread: Some(thread),
        })
    }

    /// The reactor this worker drives.
    #[must_use]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Ask the worker to stop and wait for its thread to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.reactor.interrupt();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn runs_deferred_functions_and_stops() {
        let reactor = Reactor::new(&EngineConfig::default()).unwrap();
        let mut worker = Worker::spawn("worker-test", Arc::clone(&reactor), 1).unwrap();

        let (tx, rx) = flume::bounded(1);
        use crate::strand::Executor;
        reactor.execute(Box::new(move || {
            let _ = tx.send(42);
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        worker.stop();
    }

    #[test]
    fn fires_timers_while_blocked() {
        let reactor = Reactor::new(&EngineConfig::default()).unwrap();
        let mut worker = Worker::spawn("worker-timer", Arc::clone(&reactor), 1).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = flume::bounded(1);
        let counter = Arc::clone(&fired);
        let timer = reactor.schedule_timer(
            Instant::now() + Duration::from_millis(20),
            None,
            Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }),
            None,
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.forget();
        worker.stop();
    }
}
