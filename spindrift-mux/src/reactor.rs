//! The readiness multiplexer.
//!
//! A reactor owns a driver, a controller, a timer queue, and a table
//! of registered sockets. Workers call [`Reactor::run_once`] in a
//! loop: wait on the driver, dispatch each event to its socket under a
//! processor lease, fire due timers, then drain deferred functions.
//!
//! The socket table holds weak references; a socket whose owner has
//! dropped every strong handle is detached instead of dispatched.
//! Detaching is the two-phase handshake of [`crate::detach`]: once the
//! last lease is released, the registration is removed, the driver
//! forgets the handle, and the socket's detach notification runs on
//! its strand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use spindrift_core::descriptor::Handle;
use spindrift_core::error::{Error, ErrorKind, Result};

use crate::config::EngineConfig;
use crate::controller::{Controller, CONTROLLER_TOKEN};
use crate::detach::{DetachContext, DetachProgress, DetachState};
use crate::driver::{create_driver, Driver};
use crate::event::{Interest, PollEvent};
use crate::metrics::Metrics;
use crate::strand::{Executor, Job, Strand};
use crate::timer::{Timer, TimerHandler, TimerQueue};

/// A socket driven by a reactor.
///
/// `process_event` runs on a worker thread while a processor lease is
/// held; it must not block the worker. `process_detached` runs exactly
/// once, on the socket's strand when it has one, after the last
/// dispatch has returned.
pub trait ReactorSocket: Send + Sync {
    /// The OS handle the reactor registers with its driver.
    fn handle(&self) -> Handle;

    /// Dispatch one readiness event.
    fn process_event(self: Arc<Self>, event: &PollEvent);

    /// The socket is detached; no further dispatch will occur.
    fn process_detached(self: Arc<Self>);

    /// The socket's serialization strand, if it has one.
    fn strand(&self) -> Option<Arc<Strand>> {
        None
    }
}

struct InterestState {
    desired: Interest,
    programmed: Option<Interest>,
}

/// One (reactor, socket) attachment.
pub struct Registration {
    token: usize,
    handle: Handle,
    detach: DetachContext,
    interest: Mutex<InterestState>,
    handler: Weak<dyn ReactorSocket>,
}

impl Registration {
    /// The registration token events for this socket carry.
    #[must_use]
    pub fn token(&self) -> usize {
        self.token
    }

    /// The detach coordinator of this attachment.
    #[must_use]
    pub fn detach_context(&self) -> &DetachContext {
        &self.detach
    }

    /// The currently requested interest.
    #[must_use]
    pub fn interest(&self) -> Interest {
        self.interest.lock().desired
    }
}

/// The readiness multiplexer.
pub struct Reactor {
    driver: Box<dyn Driver>,
    controller: Controller,
    sockets: Mutex<HashMap<usize, Arc<Registration>>>,
    next_token: AtomicUsize,
    jobs_tx: flume::Sender<Job>,
    jobs_rx: flume::Receiver<Job>,
    timers: Arc<TimerQueue>,
    metrics: Metrics,
    load: AtomicUsize,
    max_timers_per_wait: usize,
}

impl Reactor {
    /// Create a reactor configured by `config`.
    pub fn new(config: &EngineConfig) -> Result<Arc<Self>> {
        let driver = create_driver(&config.driver_name, config.max_events_per_wait)?;
        let controller = Controller::new()?;
        driver.attach(controller.handle()?, CONTROLLER_TOKEN, Interest::READABLE)?;

        let (jobs_tx, jobs_rx) = flume::unbounded();
        Ok(Arc::new(Self {
            driver,
            controller,
            sockets: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(CONTROLLER_TOKEN + 1),
            jobs_tx,
            jobs_rx,
            timers: TimerQueue::new(),
            metrics: Metrics::new(config.metrics_per_waiter),
            load: AtomicUsize::new(0),
            max_timers_per_wait: config.max_timers_per_wait,
        }))
    }

    /// The name of the underlying driver.
    #[must_use]
    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Register `socket` with no interest programmed yet.
    pub fn register_socket<S>(&self, socket: &Arc<S>) -> Result<Arc<Registration>>
    where
        S: ReactorSocket + 'static,
    {
        let handler: Weak<dyn ReactorSocket> =
            Arc::downgrade(&(Arc::clone(socket) as Arc<dyn ReactorSocket>));
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            token,
            handle: socket.handle(),
            detach: DetachContext::new(),
            interest: Mutex::new(InterestState {
                desired: Interest::NONE,
                programmed: None,
            }),
            handler,
        });
        self.sockets.lock().insert(token, Arc::clone(&registration));
        self.load.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_socket(true);
        tracing::debug!(token, "socket registered");
        Ok(registration)
    }

    /// Add readability to the socket's interest.
    pub fn show_readable(&self, registration: &Registration) -> Result<()> {
        self.modify_interest(registration, |i| i.readable(true))
    }

    /// Remove readability from the socket's interest.
    pub fn hide_readable(&self, registration: &Registration) -> Result<()> {
        self.modify_interest(registration, |i| i.readable(false))
    }

    /// Add writability to the socket's interest.
    pub fn show_writable(&self, registration: &Registration) -> Result<()> {
        self.modify_interest(registration, |i| i.writable(true))
    }

    /// Remove writability from the socket's interest.
    pub fn hide_writable(&self, registration: &Registration) -> Result<()> {
        self.modify_interest(registration, |i| i.writable(false))
    }

    fn modify_interest(
        &self,
        registration: &Registration,
        f: impl FnOnce(Interest) -> Interest,
    ) -> Result<()> {
        if registration.detach.state() != DetachState::Attached {
            return Err(Error::new(ErrorKind::Invalid));
        }
        let mut state = registration.interest.lock();
        state.desired = f(state.desired);
        match (state.desired.is_empty(), state.programmed) {
            (true, Some(_)) => {
                self.driver.detach(registration.handle)?;
                state.programmed = None;
            }
            (false, None) => {
                self.driver
                    .attach(registration.handle, registration.token, state.desired)?;
                state.programmed = Some(state.desired);
            }
            // Reprogramming re-arms edge-triggered drivers even when the
            // interest is unchanged.
            (false, Some(_)) => {
                self.driver
                    .update(registration.handle, registration.token, state.desired)?;
                state.programmed = Some(state.desired);
            }
            (true, None) => {}
        }
        Ok(())
    }

    /// Start the two-phase detach of a socket. Once complete, no
    /// further dispatch occurs and the socket's detach notification
    /// runs on its strand.
    pub fn detach_socket(&self, registration: &Arc<Registration>) -> Result<DetachProgress> {
        let progress = registration.detach.detach()?;
        if progress == DetachProgress::Completed {
            self.finish_detach(registration);
        }
        Ok(progress)
    }

    fn finish_detach(&self, registration: &Arc<Registration>) {
        self.sockets.lock().remove(&registration.token);
        {
            let mut state = registration.interest.lock();
            if state.programmed.take().is_some() {
                let _ = self.driver.detach(registration.handle);
            }
        }
        self.load.fetch_sub(1, Ordering::Relaxed);
        self.metrics.record_socket(false);
        tracing::debug!(token = registration.token, "socket detached");

        if let Some(socket) = registration.handler.upgrade() {
            let strand = socket.strand();
            let job: Job = Box::new(move || socket.process_detached());
            match strand {
                Some(strand) => strand.execute(job),
                None => self.execute(job),
            }
        }
    }

    /// Wait for events and dispatch them. Returns how many events the
    /// driver delivered.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut events: Vec<PollEvent> = Vec::new();
        let count = self.driver.wait(&mut events, timeout)?;
        self.metrics.record_wakeup();

        let mut dispatched = 0u64;
        for event in &events {
            if event.token == CONTROLLER_TOKEN {
                let _ = self.controller.acknowledge();
                continue;
            }
            let registration = self.sockets.lock().get(&event.token).cloned();
            // Events may arrive for sockets detached in this same batch.
            let Some(registration) = registration else {
                continue;
            };
            self.dispatch(&registration, event);
            dispatched += 1;
        }
        self.metrics.record_events(dispatched);
        Ok(count)
    }

    fn dispatch(&self, registration: &Arc<Registration>, event: &PollEvent) {
        if !registration.detach.incr_processor() {
            return;
        }
        match registration.handler.upgrade() {
            Some(socket) => {
                tracing::trace!(token = event.token, "dispatching event");
                socket.process_event(event);
            }
            // The owner dropped its last handle; detach in its stead.
            None => {
                let _ = registration.detach.detach();
            }
        }
        if registration.detach.decr_processor() {
            self.finish_detach(registration);
        }
    }

    /// Fire timers due at `now`. Returns how many fired.
    pub fn advance_timers(&self, now: Instant) -> usize {
        let fired = self.timers.advance(now, self.max_timers_per_wait);
        self.metrics.record_timers(fired as u64);
        fired
    }

    /// Run queued deferred functions. Returns how many ran.
    pub fn drain_functions(&self) -> usize {
        let mut executed = 0;
        while let Ok(job) = self.jobs_rx.try_recv() {
            job();
            executed += 1;
        }
        self.metrics.record_functions(executed as u64);
        executed
    }

    /// One wait/dispatch cycle: wait no longer than `timeout` (bounded
    /// further by the earliest timer deadline), dispatch events, fire
    /// due timers, drain deferred functions. Returns how much work was
    /// done.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let now = Instant::now();
        let wait_timeout = match self.earliest_deadline() {
            Some(deadline) => {
                let until_deadline = deadline.saturating_duration_since(now);
                Some(match timeout {
                    Some(user) => user.min(until_deadline),
                    None => until_deadline,
                })
            }
            None => timeout,
        };
        let events = self.poll(wait_timeout)?;
        let timers = self.advance_timers(Instant::now());
        let functions = self.drain_functions();
        Ok(events + timers + functions)
    }

    /// Wake a blocked wait.
    pub fn interrupt(&self) {
        self.controller.interrupt(1);
    }

    /// The deadline of the next scheduled timer.
    #[must_use]
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.timers.earliest_deadline()
    }

    /// Schedule a timer on this reactor's timer queue. A blocked wait
    /// is interrupted so the new deadline bounds it.
    pub fn schedule_timer(
        &self,
        deadline: Instant,
        period: Option<Duration>,
        handler: TimerHandler,
        strand: Option<Arc<Strand>>,
    ) -> Timer {
        let timer = self.timers.schedule(deadline, period, handler, strand);
        self.controller.interrupt(1);
        timer
    }

    /// This reactor's timer queue.
    #[must_use]
    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    /// The load metric used for socket placement.
    #[must_use]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// The counters this reactor maintains.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl Executor for Reactor {
    fn execute(&self, job: Job) {
        let _ = self.jobs_tx.send(job);
        self.controller.interrupt(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindrift_core::prelude::*;
    use std::sync::atomic::AtomicBool;

    struct ProbeSocket {
        handle: Handle,
        events: flume::Sender<PollEvent>,
        detached: AtomicBool,
    }

    impl ReactorSocket for ProbeSocket {
        fn handle(&self) -> Handle {
            self.handle
        }

        fn process_event(self: Arc<Self>, event: &PollEvent) {
            let _ = self.events.send(*event);
        }

        fn process_detached(self: Arc<Self>) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }

    fn probe_socket() -> (Descriptor, Arc<ProbeSocket>, flume::Receiver<PollEvent>) {
        let mut descriptor = Descriptor::new();
        descriptor.open(Transport::UdpIpv4).unwrap();
        descriptor.bind_any(false).unwrap();
        descriptor.set_blocking(false).unwrap();
        let handle = descriptor.handle().unwrap();
        let (tx, rx) = flume::unbounded();
        (
            descriptor,
            Arc::new(ProbeSocket {
                handle,
                events: tx,
                detached: AtomicBool::new(false),
            }),
            rx,
        )
    }

    #[test]
    fn dispatches_writability() {
        let reactor = Reactor::new(&EngineConfig::default()).unwrap();
        let (_descriptor, socket, events) = probe_socket();

        let registration = reactor.register_socket(&socket).unwrap();
        reactor.show_writable(&registration).unwrap();

        let mut observed = false;
        for _ in 0..10 {
            reactor.run_once(Some(Duration::from_millis(200))).unwrap();
            if let Ok(event) = events.try_recv() {
                assert_eq!(event.token, registration.token());
                assert!(event.writable);
                observed = true;
                break;
            }
        }
        assert!(observed, "expected a writable dispatch");
    }

    #[test]
    fn detach_without_leases_notifies() {
        let reactor = Reactor::new(&EngineConfig::default()).unwrap();
        let (_descriptor, socket, _events) = probe_socket();

        let registration = reactor.register_socket(&socket).unwrap();
        assert_eq!(
            reactor.detach_socket(&registration).unwrap(),
            DetachProgress::Completed
        );

        // The notification is a deferred function on this reactor.
        reactor.drain_functions();
        assert!(socket.detached.load(Ordering::SeqCst));

        // A second detach is an invalid state transition.
        assert_eq!(
            reactor.detach_socket(&registration).unwrap_err().kind(),
            ErrorKind::Invalid
        );
    }

    #[test]
    fn interest_changes_while_detaching_are_rejected() {
        let reactor = Reactor::new(&EngineConfig::default()).unwrap();
        let (_descriptor, socket, _events) = probe_socket();

        let registration = reactor.register_socket(&socket).unwrap();
        reactor.detach_socket(&registration).unwrap();
        assert_eq!(
            reactor.show_readable(&registration).unwrap_err().kind(),
            ErrorKind::Invalid
        );
    }

    #[test]
    fn execute_wakes_a_blocked_wait() {
        let reactor = Reactor::new(&EngineConfig::default()).unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        reactor.execute(Box::new(move || flag.store(true, Ordering::SeqCst)));

        // The controller interrupt turns this blocking wait into a
        // prompt return; the drain then runs the job.
        reactor.run_once(Some(Duration::from_secs(5))).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn load_tracks_registrations() {
        let reactor = Reactor::new(&EngineConfig::default()).unwrap();
        assert_eq!(reactor.load(), 0);

        let (_descriptor, socket, _events) = probe_socket();
        let registration = reactor.register_socket(&socket).unwrap();
        assert_eq!(reactor.load(), 1);

        reactor.detach_socket(&registration).unwrap();
        assert_eq!(reactor.load(), 0);
    }
}
