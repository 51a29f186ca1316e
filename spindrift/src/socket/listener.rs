//! The listener socket state machine.
//!
//! Lifecycle: open, bind, listen, accept, detach. As the reactor
//! reports acceptable connections the listener drains them into ready
//! stream sockets held in the accept queue, respecting its high
//! watermark; accepts pop synchronously when a connection is already
//! waiting.

use std::sync::{Arc, Weak};
use std::time::Instant;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use spindrift_core::descriptor::{Descriptor, Handle};
use spindrift_core::endpoint::{Endpoint, LocalEndpoint};
use spindrift_core::error::{Error, ErrorKind, Result};
use spindrift_core::operation::{AcceptContext, AcceptOptions, Token};
use spindrift_core::option::{SocketOption, SocketOptionKind};
use spindrift_core::transport::Transport;
use spindrift_mux::event::PollEvent;
use spindrift_mux::reactor::{Reactor, ReactorSocket, Registration};
use spindrift_mux::strand::{Executor, Strand};
use spindrift_mux::timer::Timer;

use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
use crate::queue::{AcceptOp, AcceptQueue};
use crate::socket::stream::StreamSocket;
use crate::socket::{AcceptCallback, DetachCallback, ListenerSocketOptions};

/// Places an accepted descriptor onto a reactor as a stream socket.
pub(crate) type AcceptFactory =
    Box<dyn Fn(Descriptor) -> Result<Arc<StreamSocket>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Open,
    Listening,
    Detaching,
    Detached,
}

struct ListenerInner {
    descriptor: Descriptor,
    state: ListenerState,
    accept_queue: AcceptQueue,
    user_paused: bool,
    next_token: u64,
}

/// An asynchronous listener producing connected stream sockets.
pub struct ListenerSocket {
    reactor: Arc<Reactor>,
    strand: Arc<Strand>,
    registration: OnceCell<Arc<Registration>>,
    weak_self: OnceCell<Weak<ListenerSocket>>,
    monitor_tx: SocketEventSender,
    monitor_rx: SocketMonitor,
    factory: AcceptFactory,
    inner: Mutex<ListenerInner>,
    detach_callback: Mutex<Option<DetachCallback>>,
}

type AcceptCompletion = (
    AcceptCallback,
    Result<(Arc<StreamSocket>, AcceptContext)>,
);

impl ListenerSocket {
    pub(crate) fn create(
        reactor: Arc<Reactor>,
        options: &ListenerSocketOptions,
        factory: AcceptFactory,
    ) -> Result<Arc<Self>> {
        let mut descriptor = Descriptor::new();
        descriptor.open(options.transport)?;
        descriptor.set_blocking(false)?;

        let executor: Weak<dyn Executor> = Arc::downgrade(&(reactor.clone() as Arc<dyn Executor>));
        let strand = Strand::new(executor);
        let (monitor_tx, monitor_rx) = create_monitor();

        let socket = Arc::new(Self {
            reactor: Arc::clone(&reactor),
            strand,
            registration: OnceCell::new(),
            weak_self: OnceCell::new(),
            monitor_tx,
            monitor_rx,
            factory,
            inner: Mutex::new(ListenerInner {
                descriptor,
                state: ListenerState::Open,
                accept_queue: AcceptQueue::new(
                    options.accept_queue_low_watermark,
                    options.accept_queue_high_watermark,
                ),
                user_paused: false,
                next_token: 1,
            }),
            detach_callback: Mutex::new(None),
        });
        let _ = socket.weak_self.set(Arc::downgrade(&socket));

        let registration = reactor.register_socket(&socket)?;
        socket
            .registration
            .set(registration)
            .map_err(|_| Error::new(ErrorKind::Invalid))?;
        Ok(socket)
    }

    /// The listener's transport.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.inner.lock().descriptor.transport()
    }

    /// The listener's lifecycle event stream.
    #[must_use]
    pub fn monitor(&self) -> SocketMonitor {
        self.monitor_rx.clone()
    }

    /// Bind the listener to the specified `endpoint`.
    pub fn bind(&self, endpoint: &Endpoint, reuse_address: bool) -> Result<()> {
        let inner = self.inner.lock();
        inner.descriptor.bind(endpoint, reuse_address)?;
        let bound = inner.descriptor.source_endpoint()?;
        let _ = self.monitor_tx.send(SocketEvent::Bound(bound));
        Ok(())
    }

    /// Bind the listener to any suitable address for its transport.
    pub fn bind_any(&self, reuse_address: bool) -> Result<()> {
        let inner = self.inner.lock();
        inner.descriptor.bind_any(reuse_address)?;
        let bound = inner.descriptor.source_endpoint()?;
        let _ = self.monitor_tx.send(SocketEvent::Bound(bound));
        Ok(())
    }

    /// The endpoint this listener is bound to.
    pub fn source_endpoint(&self) -> Result<Endpoint> {
        self.inner.lock().descriptor.source_endpoint()
    }

    /// Set a single socket option.
    pub fn set_option(&self, option: &SocketOption) -> Result<()> {
        self.inner.lock().descriptor.set_option(option)
    }

    /// Read back a single socket option.
    pub fn get_option(&self, kind: SocketOptionKind) -> Result<SocketOption> {
        self.inner.lock().descriptor.get_option(kind)
    }

    /// Start listening with the specified `backlog`.
    pub fn listen(&self, backlog: usize) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if inner.state != ListenerState::Open {
            return Err(Error::new(ErrorKind::Invalid));
        }
        inner.descriptor.listen(backlog)?;
        inner.state = ListenerState::Listening;
        let endpoint = inner.descriptor.source_endpoint()?;
        let _ = self.monitor_tx.send(SocketEvent::Listening(endpoint));
        self.update_interest_locked(inner);
        Ok(())
    }

    /// Accept the next connection. Pops synchronously — before this
    /// call returns — when one is already waiting; otherwise the
    /// callback fires on the listener's strand.
    pub fn accept(&self, options: AcceptOptions, callback: AcceptCallback) -> Result<()> {
        let mut ready: Option<AcceptCompletion> = None;
        {
            let inner = &mut *self.inner.lock();
            if inner.state != ListenerState::Listening {
                return Err(Error::new(ErrorKind::Invalid));
            }
            let token = options.token.unwrap_or_else(|| {
                let token = Token(inner.next_token | (1 << 63));
                inner.next_token += 1;
                token
            });

            if let Some((descriptor, peer, event)) = inner.accept_queue.pop_ready() {
                if let Some(event) = event {
                    let _ = self.monitor_tx.send(SocketEvent::AcceptQueue(event));
                    self.update_interest_locked(inner);
                }
                ready = Some((callback, self.make_stream(descriptor, peer, token)));
            } else {
                let deadline = self.arm_deadline(options.deadline, token);
                inner.accept_queue.push_op(AcceptOp {
                    token,
                    callback: Some(callback),
                    deadline,
                });
                self.update_interest_locked(inner);
            }
        }
        if let Some((callback, result)) = ready {
            callback(result);
        }
        Ok(())
    }

    /// Cancel the pending accept named by `token`, completing it with
    /// `CANCELLED`. Unknown tokens fail with `INVALID`.
    pub fn cancel(&self, token: Token) -> Result<()> {
        self.conclude(token, ErrorKind::Cancelled)
    }

    fn expire(&self, token: Token) {
        let _ = self.conclude(token, ErrorKind::Timeout);
    }

    fn conclude(&self, token: Token, kind: ErrorKind) -> Result<()> {
        let op = {
            let inner = &mut *self.inner.lock();
            inner.accept_queue.cancel(token)
        };
        match op {
            Some(mut op) => {
                if let Some(callback) = op.callback.take() {
                    let err = Error::new(kind);
                    self.strand.execute(Box::new(move || callback(Err(err))));
                }
                Ok(())
            }
            None => Err(Error::new(ErrorKind::Invalid)),
        }
    }

    /// Apply flow control: stop accepting from the OS backlog.
    pub fn apply_flow_control(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.user_paused = true;
        self.update_interest_locked(inner);
        Ok(())
    }

    /// Relax flow control, resuming accepts from the OS backlog.
    pub fn relax_flow_control(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.user_paused = false;
        self.update_interest_locked(inner);
        Ok(())
    }

    /// Remove the filesystem name of a bound local listener.
    pub fn unlink(&self) -> Result<()> {
        self.inner.lock().descriptor.unlink()
    }

    /// Detach the listener from its reactor. Pending accepts complete
    /// with `CANCELLED` before `callback` runs, exactly once, on the
    /// listener's strand.
    pub fn detach(&self, callback: DetachCallback) -> Result<()> {
        {
            let inner = &mut *self.inner.lock();
            match inner.state {
                ListenerState::Detaching | ListenerState::Detached => {
                    return Err(Error::new(ErrorKind::Invalid));
                }
                _ => {}
            }
            inner.state = ListenerState::Detaching;
            for mut op in inner.accept_queue.drain_ops() {
                if let Some(op_callback) = op.callback.take() {
                    self.strand.execute(Box::new(move || {
                        op_callback(Err(Error::new(ErrorKind::Cancelled)));
                    }));
                }
            }
        }
        *self.detach_callback.lock() = Some(callback);
        let registration = self
            .registration
            .get()
            .ok_or(Error::new(ErrorKind::Invalid))?;
        self.reactor.detach_socket(registration).map(|_| ())
    }

    // ----- internals -----

    fn weak(&self) -> Weak<ListenerSocket> {
        self.weak_self.get().cloned().unwrap_or_default()
    }

    fn arm_deadline(&self, deadline: Option<Instant>, token: Token) -> Option<Timer> {
        let deadline = deadline?;
        let weak = self.weak();
        Some(self.reactor.schedule_timer(
            deadline,
            None,
            Arc::new(move |_event| {
                if let Some(listener) = weak.upgrade() {
                    listener.expire(token);
                }
            }),
            None,
        ))
    }

    fn make_stream(
        &self,
        descriptor: Descriptor,
        peer: Endpoint,
        token: Token,
    ) -> Result<(Arc<StreamSocket>, AcceptContext)> {
        let stream = (self.factory)(descriptor)?;
        let context = AcceptContext {
            token,
            remote_endpoint: Some(peer),
        };
        Ok((stream, context))
    }

    fn update_interest_locked(&self, inner: &mut ListenerInner) {
        let Some(registration) = self.registration.get() else {
            return;
        };
        let want_accept = inner.state == ListenerState::Listening
            && !inner.user_paused
            && inner.accept_queue.has_capacity();
        if want_accept {
            let _ = self.reactor.show_readable(registration);
        } else {
            let _ = self.reactor.hide_readable(registration);
        }
    }

    fn on_acceptable_locked(
        &self,
        inner: &mut ListenerInner,
        completions: &mut Vec<AcceptCompletion>,
    ) {
        if inner.state != ListenerState::Listening {
            return;
        }
        while !inner.user_paused && inner.accept_queue.has_capacity() {
            match inner.descriptor.accept() {
                Ok((descriptor, peer)) => {
                    let _ = self.monitor_tx.send(SocketEvent::Accepted(peer.clone()));
                    if let Some(mut op) = inner.accept_queue.pop_op() {
                        let result = self.make_stream(descriptor, peer, op.token);
                        if let Some(callback) = op.callback.take() {
                            completions.push((callback, result));
                        }
                    } else if let Some(event) = inner.accept_queue.push_ready(descriptor, peer) {
                        let _ = self.monitor_tx.send(SocketEvent::AcceptQueue(event));
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.is_transient() => continue,
                // Aborted handshakes and transient resource exhaustion
                // must not take the listener down.
                Err(err) if err.kind() == ErrorKind::ConnectionAborted => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
        self.update_interest_locked(inner);
    }
}

impl ReactorSocket for ListenerSocket {
    fn handle(&self) -> Handle {
        self.inner.lock().descriptor.handle().unwrap_or(-1)
    }

    fn process_event(self: Arc<Self>, event: &PollEvent) {
        let mut completions: Vec<AcceptCompletion> = Vec::new();
        if event.readable || event.error {
            let inner = &mut *self.inner.lock();
            self.on_acceptable_locked(inner, &mut completions);
        }
        for (callback, result) in completions {
            self.strand.execute(Box::new(move || callback(result)));
        }
    }

    fn process_detached(self: Arc<Self>) {
        {
            let inner = &mut *self.inner.lock();
            // Local listeners leave no stale name behind.
            if inner.descriptor.transport().is_local() {
                if let Ok(Endpoint::Local(LocalEndpoint::Path(_))) =
                    inner.descriptor.source_endpoint()
                {
                    let _ = inner.descriptor.unlink();
                }
            }
            let _ = inner.descriptor.close();
            inner.state = ListenerState::Detached;
        }
        if let Some(callback) = self.detach_callback.lock().take() {
            callback();
        }
    }

    fn strand(&self) -> Option<Arc<Strand>> {
        Some(Arc::clone(&self.strand))
    }
}
