//! The stream socket state machine.
//!
//! Lifecycle: open, connect, exchange data (optionally upgraded into
//! an encryption session), shut down, detach. Queued sends and
//! receives progress as the reactor reports readiness; transient OS
//! errors are absorbed and retried, terminal errors fail every queued
//! operation with the same error and move the socket toward shutdown.

use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use spindrift_core::descriptor::{Descriptor, Handle};
use spindrift_core::endpoint::Endpoint;
use spindrift_core::error::{Error, ErrorKind, Result};
use spindrift_core::limiter::{RateLimiter, RateLimiterDecision};
use spindrift_core::notification::Notification;
use spindrift_core::operation::{
    ConnectContext, ConnectOptions, ReceiveContext, ReceiveOptions, SendContext, SendOptions,
    SendPayload, ShutdownContext, ShutdownDirection, ShutdownOrigin, Token,
};
use spindrift_core::option::{SocketOption, SocketOptionKind};
use spindrift_core::transport::Transport;
use spindrift_mux::event::PollEvent;
use spindrift_mux::reactor::{Reactor, ReactorSocket, Registration};
use spindrift_mux::strand::{Executor, Job, Strand};
use spindrift_mux::timer::Timer;

use crate::flow::{FlowControlDirection, FlowControlGate};
use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
use crate::queue::{QueueEvent, ReadOp, ReadQueue, ReadReady, WriteEntry, WriteQueue};
use crate::session::{
    CompressionCodec, DowngradeOptions, EncryptionSession, UpgradeOptions,
};
use crate::socket::{
    ConnectCallback, DetachCallback, ReceiveCallback, SendCallback, StreamSocketOptions,
    UpgradeCallback,
};

/// A completion to run once the socket's lock is released, on the
/// socket's strand or the operation's own.
type Posting = (Option<Arc<Strand>>, Job);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Connecting,
    Connected,
    ShuttingDown,
    Shutdown,
    Detaching,
    Detached,
}

struct ConnectOp {
    token: Token,
    callback: Option<ConnectCallback>,
    _deadline: Option<Timer>,
}

struct StreamInner {
    descriptor: Descriptor,
    state: StreamState,
    upgraded: bool,
    session: Option<Arc<dyn EncryptionSession>>,
    codec: Option<Arc<dyn CompressionCodec>>,
    read_queue: ReadQueue,
    write_queue: WriteQueue,
    receive_gate: FlowControlGate,
    send_gate: FlowControlGate,
    limiter: Option<RateLimiter>,
    limiter_timer: Option<Timer>,
    connect_op: Option<ConnectOp>,
    terminal: Option<Error>,
    scratch: Vec<u8>,
    send_shutdown_pending: bool,
    send_shutdown_done: bool,
    receive_shutdown_done: bool,
    next_token: u64,
}

/// An asynchronous connection-oriented byte stream.
pub struct StreamSocket {
    reactor: Arc<Reactor>,
    strand: Arc<Strand>,
    registration: OnceCell<Arc<Registration>>,
    weak_self: OnceCell<Weak<StreamSocket>>,
    monitor_tx: SocketEventSender,
    monitor_rx: SocketMonitor,
    notifications_tx: flume::Sender<Notification>,
    notifications_rx: flume::Receiver<Notification>,
    inner: Mutex<StreamInner>,
    detach_callback: Mutex<Option<DetachCallback>>,
}

impl StreamSocket {
    /// Create a stream socket of the configured transport, registered
    /// with `reactor` but not yet connected.
    pub(crate) fn create(
        reactor: Arc<Reactor>,
        options: StreamSocketOptions,
    ) -> Result<Arc<Self>> {
        let mut descriptor = Descriptor::new();
        descriptor.open(options.transport)?;
        descriptor.set_blocking(false)?;
        Self::build(reactor, descriptor, options, StreamState::Open)
    }

    /// Wrap an accepted descriptor into a connected stream socket.
    pub(crate) fn adopt(
        reactor: Arc<Reactor>,
        descriptor: Descriptor,
        options: StreamSocketOptions,
    ) -> Result<Arc<Self>> {
        descriptor.set_blocking(false)?;
        Self::build(reactor, descriptor, options, StreamState::Connected)
    }

    fn build(
        reactor: Arc<Reactor>,
        descriptor: Descriptor,
        options: StreamSocketOptions,
        state: StreamState,
    ) -> Result<Arc<Self>> {
        let executor: Weak<dyn Executor> = Arc::downgrade(&(reactor.clone() as Arc<dyn Executor>));
        let strand = Strand::new(executor);
        let (monitor_tx, monitor_rx) = create_monitor();
        let (notifications_tx, notifications_rx) = flume::unbounded();
        let limiter = options
            .rate_limiter
            .as_ref()
            .map(|config| RateLimiter::new(config, Instant::now()));
        let read_buffer_size = options.read_buffer_size.max(1);

        let socket = Arc::new(Self {
            reactor: Arc::clone(&reactor),
            strand,
            registration: OnceCell::new(),
            weak_self: OnceCell::new(),
            monitor_tx,
            monitor_rx,
            notifications_tx,
            notifications_rx,
            inner: Mutex::new(StreamInner {
                descriptor,
                state,
                upgraded: false,
                session: None,
                codec: None,
                read_queue: ReadQueue::new(
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
                connect_op: None,
                terminal: None,
                scratch: vec![0u8; read_buffer_size],
                send_shutdown_pending: false,
                send_shutdown_done: false,
                receive_shutdown_done: false,
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

        if state == StreamState::Connected {
            let inner = &mut *socket.inner.lock();
            socket.update_interest_locked(inner);
        }
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

    /// The socket's notification queue: timestamping and zero-copy
    /// reports drained from the OS error queue.
    #[must_use]
    pub fn notifications(&self) -> flume::Receiver<Notification> {
        self.notifications_rx.clone()
    }

    /// Bind the socket to the specified source `endpoint`.
    pub fn bind(&self, endpoint: &Endpoint, reuse_address: bool) -> Result<()> {
        let inner = self.inner.lock();
        inner.descriptor.bind(endpoint, reuse_address)?;
        let bound = inner.descriptor.source_endpoint()?;
        let _ = self.monitor_tx.send(SocketEvent::Bound(bound));
        Ok(())
    }

    /// The endpoint this socket is bound to.
    pub fn source_endpoint(&self) -> Result<Endpoint> {
        self.inner.lock().descriptor.source_endpoint()
    }

    /// The endpoint of the connected peer.
    pub fn remote_endpoint(&self) -> Result<Endpoint> {
        self.inner.lock().descriptor.remote_endpoint()
    }

    /// Set a single socket option.
    pub fn set_option(&self, option: &SocketOption) -> Result<()> {
        self.inner.lock().descriptor.set_option(option)
    }

    /// Read back a single socket option.
    pub fn get_option(&self, kind: SocketOptionKind) -> Result<SocketOption> {
        self.inner.lock().descriptor.get_option(kind)
    }

    /// Initiate a connection to `endpoint`. The callback fires on the
    /// socket's strand when the connection is established or fails.
    pub fn connect(
        &self,
        endpoint: &Endpoint,
        options: ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<()> {
        let mut postings: Vec<Posting> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            if inner.state != StreamState::Open {
                return Err(Error::new(ErrorKind::Invalid));
            }
            let token = options
                .token
                .unwrap_or_else(|| Self::auto_token(&mut inner.next_token));
            inner.state = StreamState::Connecting;

            match inner.descriptor.connect(endpoint) {
                Ok(()) => {
                    inner.state = StreamState::Connected;
                    let context = self.connect_context_locked(inner, token);
                    if let Some(remote) = context.remote_endpoint.clone() {
                        let _ = self.monitor_tx.send(SocketEvent::Connected(remote));
                    }
                    postings.push((None, Box::new(move || callback(Ok(context)))));
                    self.update_interest_locked(inner);
                }
                Err(err) if err.is_transient() => {
                    let deadline = self.arm_deadline(options.deadline, token);
                    inner.connect_op = Some(ConnectOp {
                        token,
                        callback: Some(callback),
                        _deadline: deadline,
                    });
                    self.update_interest_locked(inner);
                }
                Err(err) => {
                    inner.state = StreamState::Shutdown;
                    let _ = self.monitor_tx.send(SocketEvent::Disconnected {
                        endpoint: Some(endpoint.clone()),
                        error: Some(err),
                    });
                    postings.push((None, Box::new(move || callback(Err(err)))));
                }
            }
        }
        self.dispatch(postings);
        Ok(())
    }

    /// Queue a send of `payload`. Fails immediately with `LIMIT` when
    /// the write queue cannot absorb the payload; the completion fires
    /// once the bytes have been handed to the OS.
    pub fn send(
        &self,
        payload: SendPayload,
        options: SendOptions,
        callback: SendCallback,
    ) -> Result<()> {
        self.send_with_strand(payload, options, callback, None)
    }

    /// Like [`Self::send`], with the completion on the send's own
    /// strand.
    pub fn send_with_strand(
        &self,
        payload: SendPayload,
        options: SendOptions,
        callback: SendCallback,
        strand: Option<Arc<Strand>>,
    ) -> Result<()> {
        let inner = &mut *self.inner.lock();
        match inner.state {
            StreamState::Connecting | StreamState::Connected => {}
            // A terminal failure propagates to every later submission.
            _ => return Err(inner.terminal.unwrap_or(Error::new(ErrorKind::Invalid))),
        }
        if inner.send_shutdown_pending || inner.send_shutdown_done {
            return Err(Error::new(ErrorKind::Invalid));
        }
        let payload = Self::transform_outbound_locked(inner, payload)?;
        let token = options
            .token
            .unwrap_or_else(|| Self::auto_token(&mut inner.next_token));
        let deadline = self.arm_deadline(options.deadline, token);

        let event = inner.write_queue.push(WriteEntry {
            token,
            payload,
            progress: 0,
            target: None,
            callback: Some(callback),
            strand,
            deadline,
        })?;
        if let Some(event) = event {
            let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
        }
        if inner.state == StreamState::Connected {
            self.update_interest_locked(inner);
        }
        Ok(())
    }

    /// Queue a receive. Completes synchronously — before this call
    /// returns — when the read queue already holds the minimum.
    pub fn receive(&self, options: ReceiveOptions, callback: ReceiveCallback) -> Result<()> {
        let mut ready: Option<(ReceiveCallback, Result<(Bytes, ReceiveContext)>)> = None;
        {
            let inner = &mut *self.inner.lock();
            match inner.state {
                StreamState::Connecting
                | StreamState::Connected
                | StreamState::ShuttingDown
                | StreamState::Shutdown => {}
                _ => return Err(Error::new(ErrorKind::Invalid)),
            }
            let token = options
                .token
                .unwrap_or_else(|| Self::auto_token(&mut inner.next_token));
            let min = options.min.max(1);

            if inner.read_queue.size() >= min {
                let (bytes, event) = inner.read_queue.take(options.size);
                if let Some(event) = event {
                    self.note_read_queue_drained_locked(inner, event);
                }
                let context = ReceiveContext {
                    token,
                    bytes_transferred: bytes.len(),
                    endpoint: None,
                };
                ready = Some((callback, Ok((bytes, context))));
            } else if let Some(err) = inner.terminal {
                ready = Some((callback, Err(err)));
            } else if inner.read_queue.at_eof() || inner.state == StreamState::Shutdown {
                ready = Some((callback, Err(Error::new(ErrorKind::Eof))));
            } else {
                let deadline = self.arm_deadline(options.deadline, token);
                inner.read_queue.push_op(ReadOp {
                    token,
                    size: options.size,
                    min,
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
            if let Some(mut op) = inner.connect_op.take_if(|op| op.token == token) {
                inner.state = StreamState::Shutdown;
                if let Some(callback) = op.callback.take() {
                    postings.push((None, Box::new(move || callback(Err(err)))));
                }
                self.update_interest_locked(inner);
            } else if let Some((mut entry, event)) = inner.write_queue.cancel(token) {
                if let Some(event) = event {
                    let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
                }
                let strand = entry.strand.take();
                if let Some(callback) = entry.callback.take() {
                    postings.push((strand, Box::new(move || callback(Err(err)))));
                }
                self.update_interest_locked(inner);
            } else if let Some(mut op) = inner.read_queue.cancel(token) {
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

    /// Shut down one or both directions. Sends queued before a send
    /// shutdown drain first; the OS shutdown follows the last byte.
    pub fn shutdown(&self, direction: ShutdownDirection) -> Result<()> {
        let mut postings: Vec<Posting> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            match inner.state {
                StreamState::Connected | StreamState::ShuttingDown => {}
                _ => return Err(Error::new(ErrorKind::Invalid)),
            }
            let covers_send = matches!(
                direction,
                ShutdownDirection::Send | ShutdownDirection::Both
            );
            let covers_receive = matches!(
                direction,
                ShutdownDirection::Receive | ShutdownDirection::Both
            );

            if covers_send && !inner.send_shutdown_done && !inner.send_shutdown_pending {
                if inner.write_queue.is_empty() {
                    let _ = inner.descriptor.shutdown(ShutdownDirection::Send);
                    inner.send_shutdown_done = true;
                    let _ = self
                        .monitor_tx
                        .send(SocketEvent::ShutdownComplete(ShutdownContext {
                            origin: ShutdownOrigin::Source,
                            send: true,
                            receive: inner.receive_shutdown_done,
                        }));
                } else {
                    inner.send_shutdown_pending = true;
                }
            }

            if covers_receive && !inner.receive_shutdown_done {
                let _ = inner.descriptor.shutdown(ShutdownDirection::Receive);
                inner.receive_shutdown_done = true;
                inner.receive_gate.set_shutdown_paused(true);
                inner.read_queue.set_eof();
                let _ = self
                    .monitor_tx
                    .send(SocketEvent::ShutdownComplete(ShutdownContext {
                        origin: ShutdownOrigin::Source,
                        send: inner.send_shutdown_done,
                        receive: true,
                    }));
                self.satisfy_receives_locked(inner, &mut postings);
            }

            inner.state = StreamState::ShuttingDown;
            self.maybe_enter_shutdown_locked(inner);
            self.update_interest_locked(inner);
        }
        self.dispatch(postings);
        Ok(())
    }

    /// Upgrade the connection into the specified encryption session.
    /// Valid only while connected and not already upgraded.
    pub fn upgrade(
        &self,
        session: Arc<dyn EncryptionSession>,
        _options: UpgradeOptions,
        callback: UpgradeCallback,
    ) -> Result<()> {
        {
            let inner = &mut *self.inner.lock();
            if inner.state != StreamState::Connected || inner.upgraded {
                return Err(Error::new(ErrorKind::Invalid));
            }
            inner.session = Some(session);
            inner.upgraded = true;
        }
        self.strand.execute(Box::new(move || callback(Ok(()))));
        Ok(())
    }

    /// Leave the encryption session. Valid only while upgraded.
    pub fn downgrade(&self, _options: DowngradeOptions) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if !inner.upgraded {
            return Err(Error::new(ErrorKind::Invalid));
        }
        inner.session = None;
        inner.upgraded = false;
        Ok(())
    }

    /// Pipe payloads through the specified compression codec.
    pub fn set_compression_codec(&self, codec: Option<Arc<dyn CompressionCodec>>) {
        self.inner.lock().codec = codec;
    }

    /// Apply user flow control: stop asking the multiplexer for
    /// readiness in the covered directions.
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

    /// Relax user flow control, resuming readiness interest in the
    /// covered directions.
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
    /// with `CANCELLED` before `callback` runs — exactly once, on the
    /// socket's strand, after the last in-flight dispatch returns.
    pub fn detach(&self, callback: DetachCallback) -> Result<()> {
        let mut postings: Vec<Posting> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            match inner.state {
                StreamState::Detaching | StreamState::Detached => {
                    return Err(Error::new(ErrorKind::Invalid));
                }
                _ => {}
            }
            inner.state = StreamState::Detaching;
            self.cancel_everything_locked(inner, Error::new(ErrorKind::Cancelled), &mut postings);
        }
        *self.detach_callback.lock() = Some(callback);
        // Cancellations enter the strand before the detach notification.
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

    fn weak(&self) -> Weak<StreamSocket> {
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

    fn transform_outbound_locked(
        inner: &mut StreamInner,
        payload: SendPayload,
    ) -> Result<SendPayload> {
        if inner.codec.is_none() && inner.session.is_none() {
            return Ok(payload);
        }
        let mut flat = match payload {
            SendPayload::Bytes(bytes) => bytes,
            SendPayload::Slices(slices) => {
                let mut joined = Vec::with_capacity(slices.iter().map(Bytes::len).sum());
                for slice in &slices {
                    joined.extend_from_slice(slice);
                }
                Bytes::from(joined)
            }
            SendPayload::File(_) => return Err(Error::new(ErrorKind::NotImplemented)),
        };
        if let Some(codec) = &inner.codec {
            flat = codec.deflate(flat)?;
        }
        if let Some(session) = &inner.session {
            flat = session.encode(flat)?;
        }
        Ok(SendPayload::Bytes(flat))
    }

    fn connect_context_locked(&self, inner: &mut StreamInner, token: Token) -> ConnectContext {
        ConnectContext {
            token,
            source_endpoint: inner.descriptor.source_endpoint().ok(),
            remote_endpoint: inner.descriptor.remote_endpoint().ok(),
            attempts: 1,
        }
    }

    fn note_read_queue_drained_locked(&self, inner: &mut StreamInner, event: QueueEvent) {
        let _ = self.monitor_tx.send(SocketEvent::ReadQueue(event));
        inner.receive_gate.set_watermark_paused(false);
        self.update_interest_locked(inner);
    }

    fn update_interest_locked(&self, inner: &mut StreamInner) {
        let Some(registration) = self.registration.get() else {
            return;
        };
        let want_receive = matches!(
            inner.state,
            StreamState::Connected | StreamState::ShuttingDown
        ) && inner.receive_gate.allows()
            && !inner.read_queue.at_eof();
        let want_send = match inner.state {
            StreamState::Connecting => true,
            StreamState::Connected | StreamState::ShuttingDown => {
                inner.send_gate.allows()
                    && (!inner.write_queue.is_empty() || inner.send_shutdown_pending)
            }
            _ => false,
        };
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

    fn fail_locked(&self, inner: &mut StreamInner, err: Error, postings: &mut Vec<Posting>) {
        if matches!(
            inner.state,
            StreamState::Detaching | StreamState::Detached
        ) {
            return;
        }
        inner.state = StreamState::Shutdown;
        inner.terminal = Some(err);
        let endpoint = inner.descriptor.remote_endpoint().ok();
        let _ = self.monitor_tx.send(SocketEvent::Disconnected {
            endpoint,
            error: Some(err),
        });
        self.cancel_everything_locked(inner, err, postings);
        self.update_interest_locked(inner);
    }

    fn cancel_everything_locked(
        &self,
        inner: &mut StreamInner,
        err: Error,
        postings: &mut Vec<Posting>,
    ) {
        if let Some(mut op) = inner.connect_op.take() {
            if let Some(callback) = op.callback.take() {
                postings.push((None, Box::new(move || callback(Err(err)))));
            }
        }
        let (entries, event) = inner.write_queue.drain();
        if let Some(event) = event {
            let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
        }
        for mut entry in entries {
            let strand = entry.strand.take();
            if let Some(callback) = entry.callback.take() {
                postings.push((strand, Box::new(move || callback(Err(err)))));
            }
        }
        for mut op in inner.read_queue.drain_ops() {
            if let Some(callback) = op.callback.take() {
                postings.push((None, Box::new(move || callback(Err(err)))));
            }
        }
        inner.send_gate.set_shutdown_paused(true);
        inner.receive_gate.set_shutdown_paused(true);
        inner.limiter_timer = None;
    }

    fn maybe_enter_shutdown_locked(&self, inner: &mut StreamInner) {
        if inner.send_shutdown_done && inner.receive_shutdown_done {
            inner.state = StreamState::Shutdown;
        }
    }

    fn resume_rate_limited_sends(&self) {
        let inner = &mut *self.inner.lock();
        inner.send_gate.set_rate_paused(false);
        inner.limiter_timer = None;
        self.update_interest_locked(inner);
    }

    fn on_error_locked(&self, inner: &mut StreamInner, postings: &mut Vec<Posting>) {
        // Error-queue traffic (timestamps, zero-copy reports) raises
        // the error condition without poisoning the socket.
        if let Ok(notifications) = inner.descriptor.receive_notifications() {
            if !notifications.is_empty() {
                for notification in notifications {
                    let _ = self.notifications_tx.send(notification);
                }
                return;
            }
        }
        let err = match inner.descriptor.get_last_error() {
            Ok(Some(err)) => err,
            Ok(None) => return,
            Err(err) => err,
        };
        if err.is_transient() {
            return;
        }
        if inner.state == StreamState::Connecting {
            inner.state = StreamState::Shutdown;
            if let Some(mut op) = inner.connect_op.take() {
                if let Some(callback) = op.callback.take() {
                    postings.push((None, Box::new(move || callback(Err(err)))));
                }
            }
            let _ = self.monitor_tx.send(SocketEvent::Disconnected {
                endpoint: None,
                error: Some(err),
            });
            self.update_interest_locked(inner);
            return;
        }
        self.fail_locked(inner, err, postings);
    }

    fn on_writable_locked(&self, inner: &mut StreamInner, postings: &mut Vec<Posting>) {
        if inner.state == StreamState::Connecting {
            self.finish_connect_locked(inner, postings);
        }
        if matches!(
            inner.state,
            StreamState::Connected | StreamState::ShuttingDown
        ) {
            self.drain_write_queue_locked(inner, postings);
        }
    }

    fn finish_connect_locked(&self, inner: &mut StreamInner, postings: &mut Vec<Posting>) {
        match inner.descriptor.get_last_error() {
            Ok(None) => {
                inner.state = StreamState::Connected;
                let token = inner
                    .connect_op
                    .as_ref()
                    .map_or(Token::NONE, |op| op.token);
                let context = self.connect_context_locked(inner, token);
                if let Some(remote) = context.remote_endpoint.clone() {
                    let _ = self.monitor_tx.send(SocketEvent::Connected(remote));
                }
                if let Some(mut op) = inner.connect_op.take() {
                    if let Some(callback) = op.callback.take() {
                        postings.push((None, Box::new(move || callback(Ok(context)))));
                    }
                }
                self.update_interest_locked(inner);
            }
            Ok(Some(err)) | Err(err) => {
                inner.state = StreamState::Shutdown;
                if let Some(mut op) = inner.connect_op.take() {
                    if let Some(callback) = op.callback.take() {
                        postings.push((None, Box::new(move || callback(Err(err)))));
                    }
                }
                let _ = self.monitor_tx.send(SocketEvent::Disconnected {
                    endpoint: None,
                    error: Some(err),
                });
                self.update_interest_locked(inner);
            }
        }
    }

    fn drain_write_queue_locked(&self, inner: &mut StreamInner, postings: &mut Vec<Posting>) {
        if !inner.send_gate.allows() {
            self.update_interest_locked(inner);
            return;
        }
        loop {
            let Some(front) = inner.write_queue.front_mut() else {
                if inner.send_shutdown_pending {
                    let _ = inner.descriptor.shutdown(ShutdownDirection::Send);
                    inner.send_shutdown_pending = false;
                    inner.send_shutdown_done = true;
                    let _ = self
                        .monitor_tx
                        .send(SocketEvent::ShutdownComplete(ShutdownContext {
                            origin: ShutdownOrigin::Source,
                            send: true,
                            receive: inner.receive_shutdown_done,
                        }));
                    self.maybe_enter_shutdown_locked(inner);
                }
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

            match inner.descriptor.send(&front.payload, front.progress) {
                Ok(sent) => {
                    front.progress += sent;
                    let complete = front.progress >= front.payload.len();
                    if let Some(event) = inner.write_queue.record_progress(sent) {
                        let _ = self.monitor_tx.send(SocketEvent::WriteQueue(event));
                    }
                    if complete {
                        if let Some(mut entry) = inner.write_queue.pop_front() {
                            let context = SendContext {
                                token: entry.token,
                                bytes_transferred: entry.progress,
                            };
                            let strand = entry.strand.take();
                            if let Some(callback) = entry.callback.take() {
                                postings.push((strand, Box::new(move || callback(Ok(context)))));
                            }
                        }
                    } else if sent == 0 {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fail_locked(inner, err, postings);
                    return;
                }
            }
        }
        self.update_interest_locked(inner);
    }

    fn on_readable_locked(&self, inner: &mut StreamInner, postings: &mut Vec<Posting>) {
        if !matches!(
            inner.state,
            StreamState::Connected | StreamState::ShuttingDown
        ) {
            return;
        }
        while inner.receive_gate.allows()
            && !inner.read_queue.watermarks().is_breached()
            && !inner.read_queue.at_eof()
        {
            match inner.descriptor.receive(&mut inner.scratch) {
                Ok(0) => {
                    inner.read_queue.set_eof();
                    let _ = self
                        .monitor_tx
                        .send(SocketEvent::ShutdownComplete(ShutdownContext {
                            origin: ShutdownOrigin::Remote,
                            send: false,
                            receive: true,
                        }));
                    break;
                }
                Ok(received) => {
                    let mut chunk = Bytes::copy_from_slice(&inner.scratch[..received]);
                    if let Some(session) = &inner.session {
                        chunk = match session.decode(chunk) {
                            Ok(chunk) => chunk,
                            Err(err) => {
                                self.fail_locked(inner, err, postings);
                                return;
                            }
                        };
                    }
                    if let Some(codec) = &inner.codec {
                        chunk = match codec.inflate(chunk) {
                            Ok(chunk) => chunk,
                            Err(err) => {
                                self.fail_locked(inner, err, postings);
                                return;
                            }
                        };
                    }
                    if let Some(event) = inner.read_queue.append(&chunk) {
                        let _ = self.monitor_tx.send(SocketEvent::ReadQueue(event));
                        inner.receive_gate.set_watermark_paused(true);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fail_locked(inner, err, postings);
                    return;
                }
            }
        }
        self.satisfy_receives_locked(inner, postings);
        self.update_interest_locked(inner);
    }

    fn satisfy_receives_locked(&self, inner: &mut StreamInner, postings: &mut Vec<Posting>) {
        while let Some((ready, event)) = inner.read_queue.pop_satisfiable() {
            if let Some(event) = event {
                let _ = self.monitor_tx.send(SocketEvent::ReadQueue(event));
                inner.receive_gate.set_watermark_paused(false);
            }
            match ready {
                ReadReady::Data(mut op, bytes) => {
                    let context = ReceiveContext {
                        token: op.token,
                        bytes_transferred: bytes.len(),
                        endpoint: None,
                    };
                    if let Some(callback) = op.callback.take() {
                        postings.push((None, Box::new(move || callback(Ok((bytes, context))))));
                    }
                }
                ReadReady::Eof(mut op) => {
                    if let Some(callback) = op.callback.take() {
                        postings.push((
                            None,
                            Box::new(move || callback(Err(Error::new(ErrorKind::Eof)))),
                        ));
                    }
                }
            }
        }
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

impl ReactorSocket for StreamSocket {
    fn handle(&self) -> Handle {
        self.inner.lock().descriptor.handle().unwrap_or(-1)
    }

    fn process_event(self: Arc<Self>, event: &PollEvent) {
        let mut postings: Vec<Posting> = Vec::new();
        {
            let inner = &mut *self.inner.lock();
            if event.error {
                self.on_error_locked(inner, &mut postings);
            }
            if event.writable {
                self.on_writable_locked(inner, &mut postings);
            }
            if event.readable || event.read_closed {
                self.on_readable_locked(inner, &mut postings);
            }
        }
        self.dispatch(postings);
    }

    fn process_detached(self: Arc<Self>) {
        {
            let inner = &mut *self.inner.lock();
            let _ = inner.descriptor.close();
            inner.state = StreamState::Detached;
        }
        if let Some(callback) = self.detach_callback.lock().take() {
            callback();
        }
    }

    fn strand(&self) -> Option<Arc<Strand>> {
        Some(Arc::clone(&self.strand))
    }
}
