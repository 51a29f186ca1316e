//! The pluggable OS multiplexer.
//!
//! A driver reports readiness for registered handles. The engine never
//! issues multiplexing syscalls itself; everything goes through this
//! trait so a foreign event loop can be configured in by name. The
//! default driver is backed by `mio`.

use std::time::Duration;

use parking_lot::Mutex;

use spindrift_core::descriptor::Handle;
use spindrift_core::error::{Error, ErrorKind, Result};

use crate::event::{Interest, PollEvent};

/// A kernel-backed readiness multiplexer over a set of registered
/// handles.
///
/// Waiters are serialized: a driver delivers each observed event to
/// exactly one concurrent `wait` call.
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// The configured name of this driver.
    fn name(&self) -> &str;

    /// Register `handle` under `token` with the specified `interest`.
    /// The interest must not be empty.
    fn attach(&self, handle: Handle, token: usize, interest: Interest) -> Result<()>;

    /// Replace the interest of a registered handle.
    fn update(&self, handle: Handle, token: usize, interest: Interest) -> Result<()>;

    /// Unregister a handle.
    fn detach(&self, handle: Handle) -> Result<()>;

    /// Block until events arrive or `timeout` passes, appending them to
    /// `events`. Returns the number of events delivered; zero means the
    /// wait timed out or was interrupted.
    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<usize>;
}

/// Create the driver configured by `name`. An empty name selects the
/// default driver.
pub fn create_driver(name: &str, capacity: usize) -> Result<Box<dyn Driver>> {
    match name {
        "" | "mio" => Ok(Box::new(MioDriver::new(capacity)?)),
        _ => Err(Error::new(ErrorKind::NotImplemented)),
    }
}

struct MioWaitState {
    poll: mio::Poll,
    events: mio::Events,
}

/// The default readiness driver, backed by `mio`.
///
/// `wait` holds the poll state for its whole duration, which is what
/// keeps a batch of events with a single waiter when several workers
/// share one driver.
pub struct MioDriver {
    registry: mio::Registry,
    wait_state: Mutex<MioWaitState>,
}

impl std::fmt::Debug for MioDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioDriver").finish_non_exhaustive()
    }
}

impl MioDriver {
    /// Create a driver able to report up to `capacity` events per wait.
    pub fn new(capacity: usize) -> Result<Self> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            registry,
            wait_state: Mutex::new(MioWaitState {
                poll,
                events: mio::Events::with_capacity(capacity.max(1)),
            }),
        })
    }

    fn mio_interest(interest: Interest) -> Result<mio::Interest> {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => Ok(mio::Interest::READABLE.add(mio::Interest::WRITABLE)),
            (true, false) => Ok(mio::Interest::READABLE),
            (false, true) => Ok(mio::Interest::WRITABLE),
            (false, false) => Err(Error::new(ErrorKind::Invalid)),
        }
    }
}

impl Driver for MioDriver {
    fn name(&self) -> &str {
        "mio"
    }

    fn attach(&self, handle: Handle, token: usize, interest: Interest) -> Result<()> {
        let mut source = mio::unix::SourceFd(&handle);
        self.registry
            .register(&mut source, mio::Token(token), Self::mio_interest(interest)?)?;
        Ok(())
    }

    fn update(&self, handle: Handle, token: usize, interest: Interest) -> Result<()> {
        let mut source = mio::unix::SourceFd(&handle);
        self.registry.reregister(
            &mut source,
            mio::Token(token),
            Self::mio_interest(interest)?,
        )?;
        Ok(())
    }

    fn detach(&self, handle: Handle) -> Result<()> {
        let mut source = mio::unix::SourceFd(&handle);
        self.registry.deregister(&mut source)?;
        Ok(())
    }

    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<usize> {
        let mut state = self.wait_state.lock();
        let state = &mut *state;
        if let Err(err) = state.poll.poll(&mut state.events, timeout) {
            let err = Error::from(err);
            // An interrupted wait is a spurious wake-up, not a failure.
            if err.kind() == ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        let mut count = 0;
        for event in state.events.iter() {
            events.push(PollEvent {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                read_closed: event.is_read_closed(),
                write_closed: event.is_write_closed(),
            });
            count += 1;
        }
        Ok(count)
    }
}
