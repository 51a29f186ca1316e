//! The datagram socket state machine.
//!
//! Lifecycle: open, bind, optionally connect a default peer, exchange
//! messages, shut down, detach. Receives complete one message at a
//! time with the origin endpoint in the context; sends carry an
//! explicit target unless a default peer is set.

use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use spindrift_core::descriptor::{Descriptor, Handle};
use spindrift_core::endpoint::Endpoint;
use spindrift_core::error::{Error, ErrorKind, Result};
use spindrift_core::limiter::{RateLimiter, RateLimiterDecision};
use spindrift_core::operation::{
    ReceiveContext, ReceiveOptions, SendContext, SendOptions, SendPayload, ShutdownContext,
    ShutdownDirection, ShutdownOrigin, Token,
};
use spindrift_core::option::{SocketOption, SocketOptionKind};
use spindrift_core::transport::Transport;
use spindrift_mux::event::PollEvent;
use spindrift_mux::reactor::{Reactor, ReactorSocket, Registration};
use spindrift_mux::strand::{Executor, Job, Strand};
use spindrift_mux::timer::Timer;

use crate::flow::{FlowControlDirection, FlowControlGate};
use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
use crate::queue::{MessageQueue, ReadOp, WriteEntry, WriteQueue};
use crate::socket::{DatagramSocketOptions, DetachCallback, ReceiveCallback, SendCallback};

type Posting = (Option<Arc<Strand>>, Job);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatagramState {
    Open,
    Connected,
    Shutdown,
    Detaching,
    Detached,
}

struct DatagramInner {
    descriptor: Descriptor,
    state: DatagramState,
    peer: Option<Endpoint>,
    message_queue: MessageQueue,
    write_queue: WriteQueue,
    receive_gate: FlowControlGate,
    send_gate: FlowControlGate,
    limiter: Option<RateLimiter>,
    limiter_timer: Option<Timer>,
    scratch: Vec<u8>,
    next_token: u64,
}

/// An asynchronous connectionless message socket.
pub struct DatagramSocket {
    reactor: Arc<Reactor>,
    strand: Arc<Strand>,
    registration: OnceCell<Arc<Registration>>,
    weak_self: OnceCell<Weak<DatagramSocket>>,
    monitor_tx: SocketEventSender,
    monitor_rx: SocketMonitor,
    inner: Mutex<DatagramInner>,
    detach_callback: Mutex<Option<DetachCallback>>,
}

impl DatagramSocket {
    pub(crate) fn create(
        reactor: Arc<Reactor>,
        options: &DatagramSocketOptions,
    ) -> Result<Arc<Self>> {
        let mut descriptor = Descriptor::new();
        descriptor.open(options.transport)?;
        descriptor.set_blocking(false)?;

        let executor: Weak<dyn Executor> = Arc::downgrade(&(reactor.clone() as Arc<dyn Executor>));
        let strand = Strand::new(executor);
        let (monitor_tx, monitor_rx) = create_monitor();
        let limiter = options
            .rate_limiter
            .as_ref()
            .map(|config| RateLimiter::new(config, Instant::now()));

        let socket = Arc::new(Self {
            reactor: Arc::clone(&reactor),
            strand,
            registration: OnceCell::new(),
            weak_self: OnceCell::new(),
            monitor_tx,
            monitor_rx,
            inner: Mutex::new(DatagramInner {
                descriptor,
                state: DatagramState::Open,
                peer: None,
                message_queue: MessageQueue::new(
                    options.read_queue_low_watermark,
                    options.read_queue_high_watermark,
                ),
                write_queue: WriteQueue::new(
                    options.write_queue_low_watermark,
                    options.write_queue_high_watermark,
                ),
                receive_gate: FlowControlGate::new(),
                send_gate: FlowControlGate::new(),
                limiter,
                limiter_timer: None,
                scratch: vec![0u8; options.max_datagram_size.max(1)],
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

    /// The socket's transport.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.inner.lock().descriptor.transport()
    }

    /// The socket's lifecycle event stream.
    #[must_use]
    pub fn monitor(&self) -> SocketMonitor {
        self.monitor_rx.clone()
    }

    /// Bind the socket to the specified source `endpoint` and start
    /// receiving.
    pub fn bind(&self, endpoint: &Endpoint, reuse_address: bool) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.descriptor.bind(endpoint, reuse_address)?;
        let bound = inner.descriptor.source_endpoint()?;
        let _ = self.monitor_tx.send(SocketEvent::Bound(bound));
        self.update_interest_locked(inner);
        Ok(())
    }

    /// Bind the socket to any suitable address for its transport and
    /// start receiving.
    pub fn bind_any(&self, reuse_address: bool) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.descriptor.bind_any(reuse_address)?;
        let bound = inner.descriptor.source_endpoint()?;
        let _ = self.monitor_tx.send(SocketEvent::Bound(bound));
        self.update_interest_locked(inner);
        Ok(())
    }

    /// Set `endpoint` as the default peer. Sends without a target go
    /// there; receives are filtered to it by the OS.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let inner = &mut *self.inner.lock();
        match inner.state {
            DatagramState::Open | DatagramState::Connected => {}
            _ => return Err(Error::new(ErrorKind::Invalid)),
        }
        inner.descriptor.connect(endpoint)?;
        inner.state = DatagramState::Connected;
        inner.peer = Some(endpoint.clone());
        let _ = self.monitor_tx.send(SocketEvent::Connected(endpoint.clone()));
        self.update_interest_locked(inner);
        Ok(())
    }

    /// The endpoint this socket is bound to.
    pub fn source_endpoint(&self) -> Result<Endpoint> {
        self.inner.lock().descriptor.source_endpoint()
    }

    /// The default peer endpoint, once connected.
    pub fn remote_endpoint(&self) -> Result<Endpoint> {
        let inner = self.inner.lock();
        match inner.descriptor.remote_endpoint() {
            Ok(endpoint) => Ok(endpoint),
            Err(err) => inner.peer.clone().ok_or(err),
        }
    }

    /// Set a single socket option.
    pub fn set_option(&self, option: &SocketOption) -> Result<()> {
        self.inner.lock().descriptor.set_option(option)
    }

    /// Read back a single socket option.
    pub fn get_option(&self, kind: SocketOptionKind) -> Result<SocketOption> {
        self.inner.lock().descriptor.get_option(kind)
    }

    /// Queue a send of `payload` to the specified `endpoint`.
    pub fn send_to(
        &self,
        payload: SendPayload,
        endpoint: &Endpoint,
        options: SendOptions,
        callback: SendCallback,
    ) -> Result<()> {
        self.enqueue_send(payload, Some(endpoint.clone()), options, callback)
    }

    /// Queue a send of `payload` to the default peer.
    pub fn send(
        &self,
        payload: SendPayload,
        options: SendOptions,
        callback: SendCallback,
    ) -> Result<()> {
        self.enqueue_send(payload, None, options, callback)
    }

    fn enqueue_send(
        &self,
        payload: SendPayload,
        target: Option<Endpoint>,
        options: SendOptions,
        callback: SendCallback,
    ) -> Result<()> {
        let inner = &mut *self.inner.lock();
        match inner.state {
            DatagramState::Open | DatagramState::Connected => {}
            _ => return Err(Error::new(ErrorKind::Invalid)),
        }
        if target.is_none() && inner.state != DatagramState::Connected {
            return Err(Error::new(ErrorKind::NotConnected));
        }
        let token = options
            .token
            .unwrap_or_else(|| Self::auto_token(&mut inner.next_token));
        let deadline = self.arm_deadline(options.deadline, token);

        let event = inner.write_queue.push(WriteEntry {
            token,
            payload,
            progress: 0,
            target,
            callback: Some(callback),
            strand: None,
            deadline,
        })?;
        if let Some(event) = event {
            let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
        }
        self.update_interest_locked(inner);
        Ok(())
    }

    /// Queue a receive of one datagram. Completes synchronously —
    /// before this call returns — when a message is already buffered.
    pub fn receive(&self, options: ReceiveOptions, callback: ReceiveCallback) -> Result<()> {
        let mut ready: Option<(ReceiveCallback, Result<(Bytes, ReceiveContext)>)> = None;
        {
            let inner = &mut *self.inner.lock();
            match inner.state {
                DatagramState::Open | DatagramState::Connected => {
                    let token = options
                        .token
                        .unwrap_or_else(|| Self::auto_token(&mut inner.next_token));
                    if let Some((bytes, origin, event)) = inner.message_queue.pop_message() {
                        if let Some(event) = event {
                            let _ = self.monitor_tx.send(SocketEvent::ReadQueue(event));
                            inner.receive_gate.set_watermark_paused(false);
                            self.update_interest_locked(inner);
                        }
                        let context = ReceiveContext {
                            token,
                            bytes_transferred: bytes.len(),
                            endpoint: Some(origin),
                        };
                        ready = Some((callback, Ok((bytes, context))));
                    } else {
                        let deadline = self.arm_deadline(options.deadline, token);
                        inner.message_queue.push_op(ReadOp {
                            token,
                            size: options.size,
                            min: options.min.max(1),
                            callback: Some(callback),
                            deadline,
                        });
                        self.update_interest_locked(inner);
                    }
                }
                DatagramState::Shutdown => {
                    ready = Some((callback, Err(Error::new(ErrorKind::Eof))));
                }
                _ => return Err(Error::new(ErrorKind::Invalid)),
            }
        }
        if let Some((callback, result)) = ready {
            callback(result);
        }
        Ok(())
    }

    /// Cancel the queued operation named by `token`, completing it
    /// with `CANCELLED`. Unknown tokens fail with `INVALID`.
    pub fn cancel(&self, token: Token) -> Result<()> {
        self.conclude(token, ErrorKind::Cancelled)
    }

    fn expire(&self, token: Token) {
        let _ = self.conclude(token, ErrorKind::Timeout);
    }

    fn conclude(&self, token: Token, kind: ErrorKind) -> Result<()> {
        let mut postings: Vec<Posting> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            let err = Error::new(kind);
            if let Some((mut entry, event)) = inner.write_queue.cancel(token) {
                if let Some(event) = event {
                    let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
                }
                if let Some(callback) = entry.callback.take() {
                    postings.push((None, Box::new(move || callback(Err(err)))));
                }
                self.update_interest_locked(inner);
            } else if let Some(mut op) = inner.message_queue.cancel(token) {
                if let Some(callback) = op.callback.take() {
                    postings.push((None, Box::new(move || callback(Err(err)))));
                }
            } else {
                return Err(Error::new(ErrorKind::Invalid));
            }
        }
        self.dispatch(postings);
        Ok(())
    }

    /// Shut down a connected datagram socket.
    pub fn shutdown(&self, direction: ShutdownDirection) -> Result<()> {
        let mut postings: Vec<Posting> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            if inner.state != DatagramState::Connected {
                return Err(Error::new(ErrorKind::NotConnected));
            }
            let _ = inner.descriptor.shutdown(direction);
            inner.state = DatagramState::Shutdown;
            inner.send_gate.set_shutdown_paused(true);
            inner.receive_gate.set_shutdown_paused(true);
            let err = Error::new(ErrorKind::Cancelled);
            let (entries, event) = inner.write_queue.drain();
            if let Some(event) = event {
                let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
            }
            for mut entry in entries {
                if let Some(callback) = entry.callback.take() {
                    postings.push((None, Box::new(move || callback(Err(err)))));
                }
            }
            for mut op in inner.message_queue.drain_ops() {
                if let Some(callback) = op.callback.take() {
                    postings.push((
                        None,
                        Box::new(move || callback(Err(Error::new(ErrorKind::Eof)))),
                    ));
                }
            }
            let _ = self
                .monitor_tx
                .send(SocketEvent::ShutdownComplete(ShutdownContext {
                    origin: ShutdownOrigin::Source,
                    send: matches!(
                        direction,
                        ShutdownDirection::Send | ShutdownDirection::Both
                    ),
                    receive: matches!(
                        direction,
                        ShutdownDirection::Receive | ShutdownDirection::Both
                    ),
                }));
            self.update_interest_locked(inner);
        }
        self.dispatch(postings);
        Ok(())
    }

    /// Enable or disable multicast loopback.
    pub fn set_multicast_loopback(&self, enabled: bool) -> Result<()> {
        self.inner.lock().descriptor.set_multicast_loopback(enabled)
    }

    /// Select the interface used for outgoing multicast datagrams.
    pub fn set_multicast_interface(&self, interface: &IpAddr) -> Result<()> {
        self.inner
            .lock()
            .descriptor
            .set_multicast_interface(interface)
    }

    /// Set the time-to-live of outgoing multicast datagrams.
    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        self.inner.lock().descriptor.set_multicast_ttl(ttl)
    }

    /// Join the specified multicast `group` on `interface`.
    pub fn join_multicast_group(&self, group: &IpAddr, interface: &IpAddr) -> Result<()> {
        self.inner
            .lock()
            .descriptor
            .join_multicast_group(group, interface)
    }

    /// Leave the specified multicast `group` on `interface`.
    pub fn leave_multicast_group(&self, group: &IpAddr, interface: &IpAddr) -> Result<()> {
        self.inner
            .lock()
            .descriptor
            .leave_multicast_group(group, interface)
    }

    /// Join the specified source-specific multicast `group`.
    pub fn join_multicast_group_source(
        &self,
        group: &IpAddr,
        source: &IpAddr,
        interface: &IpAddr,
    ) -> Result<()> {
        self.inner
            .lock()
            .descriptor
            .join_multicast_group_source(group, source, interface)
    }

    /// Leave the specified source-specific multicast `group`.
    pub fn leave_multicast_group_source(
        &self,
        group: &IpAddr,
        source: &IpAddr,
        interface: &IpAddr,
    ) -> Result<()> {
        self.inner
            .lock()
            .descriptor
            .leave_multicast_group_source(group, source, interface)
    }

    /// Apply user flow control in the covered directions.
    pub fn apply_flow_control(&self, direction: FlowControlDirection) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if direction.covers_send() {
            inner.send_gate.set_user(false);
        }
        if direction.covers_receive() {
            inner.receive_gate.set_user(false);
        }
        self.update_interest_locked(inner);
        Ok(())
    }

    /// Relax user flow control in the covered directions.
    pub fn relax_flow_control(&self, direction: FlowControlDirection) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if direction.covers_send() {
            inner.send_gate.set_user(true);
        }
        if direction.covers_receive() {
            inner.receive_gate.set_user(true);
        }
        self.update_interest_locked(inner);
        Ok(())
    }

    /// Detach the socket from its reactor. Pending operations complete
    /// with `CANCELLED` before `callback` runs, exactly once, on the
    /// socket's strand.
    pub fn detach(&self, callback: DetachCallback) -> Result<()> {
        let mut postings: Vec<Posting> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            match inner.state {
                DatagramState::Detaching | DatagramState::Detached => {
                    return Err(Error::new(ErrorKind::Invalid));
                }
                _ => {}
            }
            inner.state = DatagramState::Detaching;
            let err = Error::new(ErrorKind::Cancelled);
            let (entries, _event) = inner.write_queue.drain();
            for mut entry in entries {
                if let Some(callback) = entry.callback.take() {
                    postings.push((None, Box::new(move || callback(Err(err)))));
                }
            }
            for mut op in inner.message_queue.drain_ops() {
                if let Some(callback) = op.callback.take() {
                    postings.push((None, Box::new(move || callback(Err(err)))));
                }
            }
        }
        *self.detach_callback.lock() = Some(callback);
        self.dispatch(postings);
        let registration = self
            .registration
            .get()
            .ok_or(Error::new(ErrorKind::Invalid))?;
        self.reactor.detach_socket(registration).map(|_| ())
    }

    // ----- internals -----

    fn auto_token(next: &mut u64) -> Token {
        let token = Token(*next | (1 << 63));
        *next += 1;
        token
    }

    fn weak(&self) -> Weak<DatagramSocket> {
        self.weak_self.get().cloned().unwrap_or_default()
    }

    fn arm_deadline(&self, deadline: Option<Instant>, token: Token) -> Option<Timer> {
        let deadline = deadline?;
        let weak = self.weak();
        Some(self.reactor.schedule_timer(
            deadline,
            None,
            Arc::new(move |_event| {
                if let Some(socket) = weak.upgrade() {
                    socket.expire(token);
                }
            }),
            None,
        ))
    }

    fn update_interest_locked(&self, inner: &mut DatagramInner) {
        let Some(registration) = self.registration.get() else {
            return;
        };
        let active = matches!(inner.state, DatagramState::Open | DatagramState::Connected);
        let want_receive = active
            && inner.receive_gate.allows()
            && !inner.message_queue.watermarks().is_breached();
        let want_send = active && inner.send_gate.allows() && !inner.write_queue.is_empty();
        if want_receive {
            let _ = self.reactor.show_readable(registration);
        } else {
            let _ = self.reactor.hide_readable(registration);
        }
        if want_send {
            let _ = self.reactor.show_writable(registration);
        } else {
            let _ = self.reactor.hide_writable(registration);
        }
    }

    fn drain_write_queue_locked(&self, inner: &mut DatagramInner, postings: &mut Vec<Posting>) {
        if !inner.send_gate.allows() {
            self.update_interest_locked(inner);
            return;
        }
        loop {
            let Some(front) = inner.write_queue.front_mut() else {
                break;
            };

            if let Some(limiter) = inner.limiter.as_mut() {
                let now = Instant::now();
                match limiter.submit(front.remaining() as u64, now) {
                    RateLimiterDecision::Allowed => {}
                    RateLimiterDecision::WaitUntil(at) => {
                        inner.send_gate.set_rate_paused(true);
                        let weak = self.weak();
                        inner.limiter_timer = Some(self.reactor.schedule_timer(
                            at,
                            None,
                            Arc::new(move |_event| {
                                if let Some(socket) = weak.upgrade() {
                                    socket.resume_rate_limited_sends();
                                }
                            }),
                            None,
                        ));
                        break;
                    }
                }
            }

            let result = match &front.target {
                Some(target) => inner.descriptor.send_to(&front.payload, target),
                None => inner.descriptor.send(&front.payload, 0),
            };
            match result {
                Ok(sent) => {
                    let len = front.payload.len();
                    if let Some(event) = inner.write_queue.record_progress(len) {
                        let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
                    }
                    if let Some(mut entry) = inner.write_queue.pop_front() {
                        let context = SendContext {
                            token: entry.token,
                            bytes_transferred: sent,
                        };
                        if let Some(callback) = entry.callback.take() {
                            postings.push((None, Box::new(move || callback(Ok(context)))));
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    // One undeliverable datagram fails its own send only.
                    let remaining = front.remaining();
                    if let Some(event) = inner.write_queue.record_progress(remaining) {
                        let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
                    }
                    if let Some(mut entry) = inner.write_queue.pop_front() {
                        if let Some(callback) = entry.callback.take() {
                            postings.push((None, Box::new(move || callback(Err(err)))));
                        }
                    }
                }
            }
        }
        self.update_interest_locked(inner);
    }

    fn on_readable_locked(&self, inner: &mut DatagramInner, postings: &mut Vec<Posting>) {
        while inner.receive_gate.allows() && !inner.message_queue.watermarks().is_breached() {
            match inner.descriptor.receive_from(&mut inner.scratch) {
                Ok((received, origin)) => {
                    let bytes = Bytes::copy_from_slice(&inner.scratch[..received]);
                    if let Some(event) = inner.message_queue.push_message(bytes, origin) {
                        let _ = self.monitor_tx.send(SocketEvent::ReadQueue(event));
                        inner.receive_gate.set_watermark_paused(true);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "datagram receive failed");
                    break;
                }
            }
        }
        while let Some((mut op, bytes, origin, event)) = inner.message_queue.pop_satisfiable() {
            if let Some(event) = event {
                let _ = self.monitor_tx.send(SocketEvent::ReadQueue(event));
                inner.receive_gate.set_watermark_paused(false);
            }
            let context = ReceiveContext {
                token: op.token,
                bytes_transferred: bytes.len(),
                endpoint: Some(origin),
            };
            if let Some(callback) = op.callback.take() {
                postings.push((None, Box::new(move || callback(Ok((bytes, context))))));
            }
        }
        self.update_interest_locked(inner);
    }

    fn resume_rate_limited_sends(&self) {
        let inner = &mut *self.inner.lock();
        inner.send_gate.set_rate_paused(false);
        inner.limiter_timer = None;
        self.update_interest_locked(inner);
    }

    fn dispatch(&self, postings: Vec<Posting>) {
        for (strand, job) in postings {
            match strand {
                Some(strand) => strand.execute(job),
                None => self.strand.execute(job),
            }
        }
    }
}

impl ReactorSocket for DatagramSocket {
    fn handle(&self) -> Handle {
        self.inner.lock().descriptor.handle().unwrap_or(-1)
    }

    fn process_event(self: Arc<Self>, event: &PollEvent) {
        let mut postings: Vec<Posting> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            if event.writable {
                self.drain_write_queue_locked(inner, &mut postings);
            }
            if event.readable || event.error {
                self.on_readable_locked(inner, &mut postings);
            }
        }
        self.dispatch(postings);
    }

    fn process_detached(self: Arc<Self>) {
        {
            let inner = &mut *self.inner.lock();
            let _ = inner.descriptor.close();
            inner.state = DatagramState::Detached;
        }
        if let Some(callback) = self.detach_callback.lock().take() {
            callback();
        }
    }

    fn strand(&self) -> Option<Arc<Strand>> {
        Some(Arc::clone(&self.strand))
    }
}
