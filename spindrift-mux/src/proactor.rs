//! The completion multiplexer.
//!
//! A proactor accepts whole operations — accept, connect, send,
//! receive, shutdown — and reports their completions. Submitted
//! buffers stay pinned inside the operation records until the
//! operation completes or is cancelled; the proactor keeps no queues
//! of its own beyond those records. Completions are performed through
//! the same pluggable readiness driver the reactor uses; a
//! kernel-native completion driver plugs in behind the same trait.
//!
//! Cancellation is best-effort: an operation the OS already satisfied
//! completes with its result even if a cancel raced it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use spindrift_core::descriptor::{Descriptor, Handle};
use spindrift_core::endpoint::Endpoint;
use spindrift_core::error::{Error, ErrorKind, Result};
use spindrift_core::operation::{
    AcceptContext, AcceptOptions, ConnectContext, ConnectOptions, ReceiveContext, ReceiveOptions,
    SendContext, SendOptions, SendPayload, ShutdownContext, ShutdownDirection, ShutdownOrigin,
    Token,
};
use spindrift_core::transport::{Transport, TransportMode};

use crate::config::EngineConfig;
use crate::controller::{Controller, CONTROLLER_TOKEN};
use crate::detach::{DetachContext, DetachProgress, DetachState};
use crate::driver::{create_driver, Driver};
use crate::event::{Interest, PollEvent};
use crate::metrics::Metrics;
use crate::strand::{Executor, Job};
use crate::timer::{Timer, TimerQueue};

/// The largest single receive the proactor performs.
const MAX_RECEIVE_CHUNK: usize = 64 * 1024;

/// The result of one submitted operation.
pub enum Completion {
    /// An accept completed with a new owned descriptor and its peer.
    Accept(Result<(Descriptor, AcceptContext)>),
    /// A connect completed.
    Connect(Result<ConnectContext>),
    /// A send completed; the context reports bytes handed to the OS.
    Send(Result<SendContext>),
    /// A receive completed with the delivered bytes.
    Receive(Result<(Bytes, ReceiveContext)>),
    /// A shutdown completed.
    Shutdown(Result<ShutdownContext>),
}

/// A socket driven by a proactor.
pub trait ProactorSocket: Send + Sync {
    /// The OS handle the proactor registers with its driver.
    fn handle(&self) -> Handle;

    /// Deliver the result of one submitted operation.
    fn process_completion(self: Arc<Self>, completion: Completion);

    /// The socket is detached; no further completions will occur.
    fn process_detached(self: Arc<Self>);
}

enum Submission {
    Accept {
        options: AcceptOptions,
        _deadline: Option<Timer>,
    },
    Connect {
        options: ConnectOptions,
        _deadline: Option<Timer>,
    },
    Send {
        payload: SendPayload,
        progress: usize,
        options: SendOptions,
        _deadline: Option<Timer>,
    },
    Receive {
        options: ReceiveOptions,
        _deadline: Option<Timer>,
    },
}

impl Submission {
    fn cancelled(&self) -> Completion {
        let err = Error::new(ErrorKind::Cancelled);
        match self {
            Self::Accept { .. } => Completion::Accept(Err(err)),
            Self::Connect { .. } => Completion::Connect(Err(err)),
            Self::Send { .. } => Completion::Send(Err(err)),
            Self::Receive { .. } => Completion::Receive(Err(err)),
        }
    }

    fn timed_out(&self) -> Completion {
        let err = Error::new(ErrorKind::Timeout);
        match self {
            Self::Accept { .. } => Completion::Accept(Err(err)),
            Self::Connect { .. } => Completion::Connect(Err(err)),
            Self::Send { .. } => Completion::Send(Err(err)),
            Self::Receive { .. } => Completion::Receive(Err(err)),
        }
    }
}

struct OpRecord {
    seq: u64,
    submission: Submission,
}

struct InterestState {
    programmed: Option<Interest>,
}

struct DetachBarrier {
    done: Mutex<bool>,
    signal: Condvar,
}

/// One (proactor, socket) attachment.
pub struct Attachment {
    token: usize,
    handle: Handle,
    transport: Transport,
    detach: DetachContext,
    handler: Weak<dyn ProactorSocket>,
    read_ops: Mutex<VecDeque<OpRecord>>,
    write_ops: Mutex<VecDeque<OpRecord>>,
    interest: Mutex<InterestState>,
    barrier: DetachBarrier,
}

impl Attachment {
    /// The registration token of this attachment.
    #[must_use]
    pub fn token(&self) -> usize {
        self.token
    }

    /// The detach coordinator of this attachment.
    #[must_use]
    pub fn detach_context(&self) -> &DetachContext {
        &self.detach
    }

    fn borrow_descriptor(&self) -> Result<BorrowedDescriptor> {
        BorrowedDescriptor::new(self.handle, self.transport)
    }
}

/// A descriptor temporarily adopted around one syscall, returned to
/// its owner on drop.
struct BorrowedDescriptor {
    descriptor: Descriptor,
}

impl BorrowedDescriptor {
    fn new(handle: Handle, transport: Transport) -> Result<Self> {
        let mut descriptor = Descriptor::new();
        descriptor.acquire(handle, transport)?;
        Ok(Self { descriptor })
    }
}

impl std::ops::Deref for BorrowedDescriptor {
    type Target = Descriptor;

    fn deref(&self) -> &Descriptor {
        &self.descriptor
    }
}

impl Drop for BorrowedDescriptor {
    fn drop(&mut self) {
        let _ = self.descriptor.release();
    }
}

/// The completion multiplexer.
pub struct Proactor {
    driver: Box<dyn Driver>,
    controller: Controller,
    attachments: Mutex<HashMap<usize, Arc<Attachment>>>,
    next_token: AtomicUsize,
    next_seq: AtomicU64,
    jobs_tx: flume::Sender<Job>,
    jobs_rx: flume::Receiver<Job>,
    timers: Arc<TimerQueue>,
    metrics: Metrics,
    max_timers_per_wait: usize,
    self_ref: Mutex<Weak<Proactor>>,
}

impl Proactor {
    /// Create a proactor configured by `config`.
    pub fn new(config: &EngineConfig) -> Result<Arc<Self>> {
        let driver = create_driver(&config.driver_name, config.max_events_per_wait)?;
        let controller = Controller::new()?;
        driver.attach(controller.handle()?, CONTROLLER_TOKEN, Interest::READABLE)?;

        let (jobs_tx, jobs_rx) = flume::unbounded();
        let proactor = Arc::new(Self {
            driver,
            controller,
            attachments: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(CONTROLLER_TOKEN + 1),
            next_seq: AtomicU64::new(1),
            jobs_tx,
            jobs_rx,
            timers: TimerQueue::new(),
            metrics: Metrics::new(config.metrics_per_waiter),
            max_timers_per_wait: config.max_timers_per_wait,
            self_ref: Mutex::new(Weak::new()),
        });
        *proactor.self_ref.lock() = Arc::downgrade(&proactor);
        Ok(proactor)
    }

    /// Attach `socket`. The handle is put into non-blocking mode; no
    /// interest is programmed until an operation is submitted.
    pub fn attach<S>(&self, socket: &Arc<S>, transport: Transport) -> Result<Arc<Attachment>>
    where
        S: ProactorSocket + 'static,
    {
        let handler: Weak<dyn ProactorSocket> =
            Arc::downgrade(&(Arc::clone(socket) as Arc<dyn ProactorSocket>));
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let attachment = Arc::new(Attachment {
            token,
            handle: socket.handle(),
            transport,
            detach: DetachContext::new(),
            handler,
            read_ops: Mutex::new(VecDeque::new()),
            write_ops: Mutex::new(VecDeque::new()),
            interest: Mutex::new(InterestState { programmed: None }),
            barrier: DetachBarrier {
                done: Mutex::new(false),
                signal: Condvar::new(),
            },
        });
        attachment.borrow_descriptor()?.set_blocking(false)?;
        self.attachments
            .lock()
            .insert(token, Arc::clone(&attachment));
        self.metrics.record_socket(true);
        tracing::debug!(token, "socket attached");
        Ok(attachment)
    }

    fn check_attached(attachment: &Attachment) -> Result<()> {
        if attachment.detach.state() == DetachState::Attached {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Invalid))
        }
    }

    fn arm_deadline(
        &self,
        attachment: &Arc<Attachment>,
        deadline: Option<Instant>,
        seq: u64,
    ) -> Option<Timer> {
        let deadline = deadline?;
        let weak_proactor = self.self_ref.lock().clone();
        let weak_attachment = Arc::downgrade(attachment);
        Some(self.timers.schedule(
            deadline,
            None,
            Arc::new(move |_event| {
                if let (Some(proactor), Some(attachment)) =
                    (weak_proactor.upgrade(), weak_attachment.upgrade())
                {
                    proactor.expire_op(&attachment, seq);
                }
            }),
            None,
        ))
    }

    /// Submit an accept of the next pending connection.
    pub fn accept(&self, attachment: &Arc<Attachment>, options: AcceptOptions) -> Result<()> {
        Self::check_attached(attachment)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = self.arm_deadline(attachment, options.deadline, seq);
        attachment.read_ops.lock().push_back(OpRecord {
            seq,
            submission: Submission::Accept {
                options,
                _deadline: deadline,
            },
        });
        self.reprogram(attachment)
    }

    /// Submit a connect to `endpoint`. May complete inline on the
    /// calling thread when the OS finishes immediately.
    pub fn connect(
        &self,
        attachment: &Arc<Attachment>,
        endpoint: &Endpoint,
        options: ConnectOptions,
    ) -> Result<()> {
        Self::check_attached(attachment)?;
        let result = attachment.borrow_descriptor()?.connect(endpoint);
        match result {
            Ok(()) => {
                self.deliver(
                    attachment,
                    Completion::Connect(Ok(self.connect_context(attachment, options.token))),
                );
                Ok(())
            }
            Err(err) if err.is_transient() => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let deadline = self.arm_deadline(attachment, options.deadline, seq);
                attachment.write_ops.lock().push_back(OpRecord {
                    seq,
                    submission: Submission::Connect {
                        options,
                        _deadline: deadline,
                    },
                });
                self.reprogram(attachment)
            }
            Err(err) => {
                self.deliver(attachment, Completion::Connect(Err(err)));
                Ok(())
            }
        }
    }

    /// Submit a send. The payload stays pinned until completion.
    pub fn send(
        &self,
        attachment: &Arc<Attachment>,
        payload: SendPayload,
        options: SendOptions,
    ) -> Result<()> {
        Self::check_attached(attachment)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = self.arm_deadline(attachment, options.deadline, seq);
        attachment.write_ops.lock().push_back(OpRecord {
            seq,
            submission: Submission::Send {
                payload,
                progress: 0,
                options,
                _deadline: deadline,
            },
        });
        self.reprogram(attachment)
    }

    /// Submit a receive of up to `options.size` bytes (one datagram for
    /// datagram transports).
    pub fn receive(&self, attachment: &Arc<Attachment>, options: ReceiveOptions) -> Result<()> {
        Self::check_attached(attachment)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = self.arm_deadline(attachment, options.deadline, seq);
        attachment.read_ops.lock().push_back(OpRecord {
            seq,
            submission: Submission::Receive {
                options,
                _deadline: deadline,
            },
        });
        self.reprogram(attachment)
    }

    /// Shut down one or both directions, completing inline.
    pub fn shutdown(&self, attachment: &Arc<Attachment>, direction: ShutdownDirection) -> Result<()> {
        Self::check_attached(attachment)?;
        let result = attachment
            .borrow_descriptor()
            .and_then(|descriptor| descriptor.shutdown(direction));
        let context = result.map(|()| ShutdownContext {
            origin: ShutdownOrigin::Source,
            send: matches!(direction, ShutdownDirection::Send | ShutdownDirection::Both),
            receive: matches!(
                direction,
                ShutdownDirection::Receive | ShutdownDirection::Both
            ),
        });
        self.deliver(attachment, Completion::Shutdown(context));
        Ok(())
    }

    /// Cancel every pending operation on the attachment. Operations
    /// already satisfied by the OS still complete with their results.
    pub fn cancel(&self, attachment: &Arc<Attachment>) -> Result<()> {
        let mut completions: SmallVec<[Completion; 4]> = SmallVec::new();
        {
            let mut read_ops = attachment.read_ops.lock();
            completions.extend(read_ops.drain(..).map(|op| op.submission.cancelled()));
        }
        {
            let mut write_ops = attachment.write_ops.lock();
            completions.extend(write_ops.drain(..).map(|op| op.submission.cancelled()));
        }
        for completion in completions {
            self.deliver(attachment, completion);
        }
        self.reprogram(attachment)
    }

    fn expire_op(&self, attachment: &Arc<Attachment>, seq: u64) {
        let mut expired = None;
        for ops in [&attachment.read_ops, &attachment.write_ops] {
            let mut ops = ops.lock();
            if let Some(position) = ops.iter().position(|op| op.seq == seq) {
                expired = ops.remove(position);
                break;
            }
        }
        if let Some(op) = expired {
            self.deliver(attachment, op.submission.timed_out());
            let _ = self.reprogram(attachment);
        }
    }

    /// Start the two-phase detach and return immediately. The socket's
    /// detach notification runs once the last processor lease drains.
    pub fn detach_async(&self, attachment: &Arc<Attachment>) -> Result<DetachProgress> {
        let progress = attachment.detach.detach()?;
        if progress == DetachProgress::Completed {
            self.finish_detach(attachment);
        }
        Ok(progress)
    }

    /// Detach and wait for the final barrier. Must not be called from
    /// the thread driving this proactor.
    pub fn detach(&self, attachment: &Arc<Attachment>) -> Result<()> {
        self.detach_async(attachment)?;
        let mut done = attachment.barrier.done.lock();
        while !*done {
            attachment.barrier.signal.wait(&mut done);
        }
        Ok(())
    }

    fn finish_detach(&self, attachment: &Arc<Attachment>) {
        self.attachments.lock().remove(&attachment.token);
        {
            let mut interest = attachment.interest.lock();
            if interest.programmed.take().is_some() {
                let _ = self.driver.detach(attachment.handle);
            }
        }
        self.metrics.record_socket(false);

        let mut completions: SmallVec<[Completion; 4]> = SmallVec::new();
        completions.extend(
            attachment
                .read_ops
                .lock()
                .drain(..)
                .map(|op| op.submission.cancelled()),
        );
        completions.extend(
            attachment
                .write_ops
                .lock()
                .drain(..)
                .map(|op| op.submission.cancelled()),
        );
        for completion in completions {
            self.deliver(attachment, completion);
        }

        if let Some(socket) = attachment.handler.upgrade() {
            socket.process_detached();
        }
        tracing::debug!(token = attachment.token, "socket detached");

        let mut done = attachment.barrier.done.lock();
        *done = true;
        attachment.barrier.signal.notify_all();
    }

    fn deliver(&self, attachment: &Arc<Attachment>, completion: Completion) {
        if let Some(socket) = attachment.handler.upgrade() {
            socket.process_completion(completion);
        }
    }

    fn reprogram(&self, attachment: &Arc<Attachment>) -> Result<()> {
        if attachment.detach.state() == DetachState::Detached {
            return Ok(());
        }
        let desired = Interest::NONE
            .readable(!attachment.read_ops.lock().is_empty())
            .writable(!attachment.write_ops.lock().is_empty());
        let mut interest = attachment.interest.lock();
        match (desired.is_empty(), interest.programmed) {
            (true, Some(_)) => {
                self.driver.detach(attachment.handle)?;
                interest.programmed = None;
            }
            (false, None) => {
                self.driver
                    .attach(attachment.handle, attachment.token, desired)?;
                interest.programmed = Some(desired);
            }
            // Reprogramming re-arms edge-triggered drivers.
            (false, Some(_)) => {
                self.driver
                    .update(attachment.handle, attachment.token, desired)?;
                interest.programmed = Some(desired);
            }
            (true, None) => {}
        }
        Ok(())
    }

    fn connect_context(&self, attachment: &Arc<Attachment>, token: Option<Token>) -> ConnectContext {
        let (source, remote) = match attachment.borrow_descriptor() {
            Ok(descriptor) => (
                descriptor.source_endpoint().ok(),
                descriptor.remote_endpoint().ok(),
            ),
            Err(_) => (None, None),
        };
        ConnectContext {
            token: token.unwrap_or(Token::NONE),
            source_endpoint: source,
            remote_endpoint: remote,
            attempts: 1,
        }
    }

    /// Wait for readiness and complete submitted operations. Returns
    /// how many driver events were observed.
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
            let attachment = self.attachments.lock().get(&event.token).cloned();
            let Some(attachment) = attachment else {
                continue;
            };
            self.dispatch(&attachment, event);
            dispatched += 1;
        }
        self.metrics.record_events(dispatched);
        Ok(count)
    }

    fn dispatch(&self, attachment: &Arc<Attachment>, event: &PollEvent) {
        if !attachment.detach.incr_processor() {
            return;
        }
        if attachment.handler.strong_count() == 0 {
            // The owner dropped its last handle; detach in its stead.
            let _ = attachment.detach.detach();
        } else {
            if event.writable || event.error {
                self.progress_write(attachment);
            }
            if event.readable || event.read_closed || event.error {
                self.progress_read(attachment);
            }
            let _ = self.reprogram(attachment);
        }
        if attachment.detach.decr_processor() {
            self.finish_detach(attachment);
        }
    }

    fn progress_write(&self, attachment: &Arc<Attachment>) {
        let mut completions: SmallVec<[Completion; 4]> = SmallVec::new();
        {
            let mut ops = attachment.write_ops.lock();
            while let Some(mut op) = ops.pop_front() {
                match &mut op.submission {
                    Submission::Connect { options, .. } => {
                        let result = attachment.borrow_descriptor().and_then(|descriptor| {
                            match descriptor.get_last_error()? {
                                Some(err) => Err(err),
                                None => Ok(()),
                            }
                        });
                        match result {
                            Ok(()) => completions.push(Completion::Connect(Ok(
                                self.connect_context(attachment, options.token)
                            ))),
                            Err(err) if err.is_transient() => {
                                ops.push_front(op);
                                break;
                            }
                            Err(err) => completions.push(Completion::Connect(Err(err))),
                        }
                    }
                    Submission::Send {
                        payload,
                        progress,
                        options,
                        ..
                    } => {
                        let result = attachment
                            .borrow_descriptor()
                            .and_then(|descriptor| descriptor.send(payload, *progress));
                        match result {
                            Ok(sent) => {
                                *progress += sent;
                                if *progress >= payload.len() {
                                    completions.push(Completion::Send(Ok(SendContext {
                                        token: options.token.unwrap_or(Token::NONE),
                                        bytes_transferred: *progress,
                                    })));
                                } else {
                                    ops.push_front(op);
                                    break;
                                }
                            }
                            Err(err) if err.is_transient() => {
                                ops.push_front(op);
                                break;
                            }
                            Err(err) => completions.push(Completion::Send(Err(err))),
                        }
                    }
                    _ => {
                        // Read-side submissions never land on this queue.
                        completions.push(op.submission.cancelled());
                    }
                }
            }
        }
        for completion in completions {
            self.deliver(attachment, completion);
        }
    }

    fn progress_read(&self, attachment: &Arc<Attachment>) {
        let mut completions: SmallVec<[Completion; 4]> = SmallVec::new();
        {
            let mut ops = attachment.read_ops.lock();
            while let Some(op) = ops.pop_front() {
                match &op.submission {
                    Submission::Accept { options, .. } => {
                        let result = attachment
                            .borrow_descriptor()
                            .and_then(|descriptor| descriptor.accept());
                        match result {
                            Ok((descriptor, endpoint)) => {
                                let context = AcceptContext {
                                    token: options.token.unwrap_or(Token::NONE),
                                    remote_endpoint: Some(endpoint),
                                };
                                completions.push(Completion::Accept(Ok((descriptor, context))));
                            }
                            Err(err) if err.kind() == ErrorKind::Interrupted => {
                                ops.push_front(op);
                                continue;
                            }
                            Err(err) if err.is_transient() => {
                                ops.push_front(op);
                                break;
                            }
                            Err(err) => completions.push(Completion::Accept(Err(err))),
                        }
                    }
                    Submission::Receive { options, .. } => {
                        let capacity = options.size.min(MAX_RECEIVE_CHUNK).max(1);
                        let mut buffer = BytesMut::zeroed(capacity);
                        let datagram = attachment.transport.mode() == TransportMode::Datagram;
                        let result = attachment.borrow_descriptor().and_then(|descriptor| {
                            if datagram {
                                descriptor
                                    .receive_from(&mut buffer)
                                    .map(|(len, endpoint)| (len, Some(endpoint)))
                            } else {
                                descriptor.receive(&mut buffer).map(|len| (len, None))
                            }
                        });
                        match result {
                            Ok((0, _)) if !datagram => {
                                completions
                                    .push(Completion::Receive(Err(Error::new(ErrorKind::Eof))));
                            }
                            Ok((len, endpoint)) => {
                                buffer.truncate(len);
                                completions.push(Completion::Receive(Ok((
                                    buffer.freeze(),
                                    ReceiveContext {
                                        token: options.token.unwrap_or(Token::NONE),
                                        bytes_transferred: len,
                                        endpoint,
                                    },
                                ))));
                            }
                            Err(err) if err.kind() == ErrorKind::Interrupted => {
                                ops.push_front(op);
                                continue;
                            }
                            Err(err) if err.is_transient() => {
                                ops.push_front(op);
                                break;
                            }
                            Err(err) => completions.push(Completion::Receive(Err(err))),
                        }
                    }
                    _ => {
                        // Write-side submissions never land on this queue.
                        completions.push(op.submission.cancelled());
                    }
                }
            }
        }
        for completion in completions {
            self.deliver(attachment, completion);
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

    /// One wait/complete cycle, bounded by the earliest timer deadline.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let now = Instant::now();
        let wait_timeout = match self.timers.earliest_deadline() {
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

    /// The counters this proactor maintains.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl Executor for Proactor {
    fn execute(&self, job: Job) {
        let _ = self.jobs_tx.send(job);
        self.controller.interrupt(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindrift_core::transport::Transport;

    struct ProbeSocket {
        handle: Handle,
        completions: flume::Sender<Completion>,
        detached: flume::Sender<()>,
    }

    impl ProactorSocket for ProbeSocket {
        fn handle(&self) -> Handle {
            self.handle
        }

        fn process_completion(self: Arc<Self>, completion: Completion) {
            let _ = self.completions.send(completion);
        }

        fn process_detached(self: Arc<Self>) {
            let _ = self.detached.send(());
        }
    }

    struct Probe {
        descriptor: Descriptor,
        socket: Arc<ProbeSocket>,
        completions: flume::Receiver<Completion>,
        detached: flume::Receiver<()>,
    }

    fn probe(descriptor: Descriptor) -> Probe {
        let handle = descriptor.handle().unwrap();
        let (completions_tx, completions_rx) = flume::unbounded();
        let (detached_tx, detached_rx) = flume::unbounded();
        Probe {
            descriptor,
            socket: Arc::new(ProbeSocket {
                handle,
                completions: completions_tx,
                detached: detached_tx,
            }),
            completions: completions_rx,
            detached: detached_rx,
        }
    }

    fn tcp_pair() -> (Descriptor, Descriptor) {
        let mut listener = Descriptor::new();
        listener.open(Transport::TcpIpv4).unwrap();
        listener
            .bind(&Endpoint::parse("127.0.0.1:0").unwrap(), false)
            .unwrap();
        listener.listen(1).unwrap();

        let mut client = Descriptor::new();
        client.open(Transport::TcpIpv4).unwrap();
        client.connect(&listener.source_endpoint().unwrap()).unwrap();

        let (server, _peer) = listener.accept().unwrap();
        (client, server)
    }

    fn pump(proactor: &Arc<Proactor>) {
        proactor
            .run_once(Some(Duration::from_millis(100)))
            .unwrap();
    }

    #[test]
    fn send_and_receive_complete() {
        let proactor = Proactor::new(&EngineConfig::default()).unwrap();
        let (client, server) = tcp_pair();
        let client = probe(client);
        let server = probe(server);

        let client_attachment = proactor
            .attach(&client.socket, Transport::TcpIpv4)
            .unwrap();
        let server_attachment = proactor
            .attach(&server.socket, Transport::TcpIpv4)
            .unwrap();

        proactor
            .receive(&server_attachment, ReceiveOptions::new().with_size(16))
            .unwrap();
        proactor
            .send(
                &client_attachment,
                SendPayload::from(Bytes::from_static(b"hello")),
                SendOptions::new(),
            )
            .unwrap();

        let mut sent = false;
        let mut received = false;
        for _ in 0..50 {
            pump(&proactor);
            while let Ok(completion) = client.completions.try_recv() {
                if let Completion::Send(result) = completion {
                    assert_eq!(result.unwrap().bytes_transferred, 5);
                    sent = true;
                }
            }
            while let Ok(completion) = server.completions.try_recv() {
                if let Completion::Receive(result) = completion {
                    let (bytes, context) = result.unwrap();
                    assert_eq!(&bytes[..], b"hello");
                    assert_eq!(context.bytes_transferred, 5);
                    received = true;
                }
            }
            if sent && received {
                break;
            }
        }
        assert!(sent && received);
        let _ = (client.descriptor, server.descriptor);
    }

    #[test]
    fn cancel_fails_pending_operations() {
        let proactor = Proactor::new(&EngineConfig::default()).unwrap();
        let (client, _server) = tcp_pair();
        let client = probe(client);

        let attachment = proactor.attach(&client.socket, Transport::TcpIpv4).unwrap();
        proactor
            .receive(&attachment, ReceiveOptions::new())
            .unwrap();
        proactor.cancel(&attachment).unwrap();

        let completion = client
            .completions
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        match completion {
            Completion::Receive(result) => {
                assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
            }
            _ => panic!("unexpected completion"),
        }
    }

    #[test]
    fn deadline_expires_a_pending_receive() {
        let proactor = Proactor::new(&EngineConfig::default()).unwrap();
        let (client, _server) = tcp_pair();
        let client = probe(client);

        let attachment = proactor.attach(&client.socket, Transport::TcpIpv4).unwrap();
        proactor
            .receive(
                &attachment,
                ReceiveOptions::new().with_deadline(Instant::now() + Duration::from_millis(20)),
            )
            .unwrap();

        let mut timed_out = false;
        for _ in 0..100 {
            pump(&proactor);
            if let Ok(Completion::Receive(result)) = client.completions.try_recv() {
                assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
                timed_out = true;
                break;
            }
        }
        assert!(timed_out);
    }

    #[test]
    fn detach_cancels_and_notifies_once() {
        let proactor = Proactor::new(&EngineConfig::default()).unwrap();
        let (client, _server) = tcp_pair();
        let client = probe(client);

        let attachment = proactor.attach(&client.socket, Transport::TcpIpv4).unwrap();
        proactor
            .receive(&attachment, ReceiveOptions::new())
            .unwrap();

        proactor.detach(&attachment).unwrap();
        client
            .detached
            .recv_timeout(Duration::from_secs(1))
            .unwrap();

        // The pending receive was drained with a cancellation.
        let completion = client
            .completions
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert!(matches!(
            completion,
            Completion::Receive(Err(err)) if err.kind() == ErrorKind::Cancelled
        ));

        assert_eq!(
            proactor.detach_async(&attachment).unwrap_err().kind(),
            ErrorKind::Invalid
        );
    }

    #[test]
    fn datagram_receive_reports_origin() {
        let proactor = Proactor::new(&EngineConfig::default()).unwrap();

        let mut sender = Descriptor::new();
        sender.open(Transport::UdpIpv4).unwrap();
        sender.bind_any(false).unwrap();

        let mut receiver_descriptor = Descriptor::new();
        receiver_descriptor.open(Transport::UdpIpv4).unwrap();
        receiver_descriptor.bind_any(false).unwrap();
        let receiver_endpoint = receiver_descriptor.source_endpoint().unwrap();
        let receiver = probe(receiver_descriptor);

        let attachment = proactor
            .attach(&receiver.socket, Transport::UdpIpv4)
            .unwrap();
        proactor
            .receive(&attachment, ReceiveOptions::new().with_size(64))
            .unwrap();

        sender
            .send_to(
                &SendPayload::from(Bytes::from_static(b"\x55")),
                &receiver_endpoint,
            )
            .unwrap();

        let mut observed = false;
        for _ in 0..50 {
            pump(&proactor);
            if let Ok(Completion::Receive(result)) = receiver.completions.try_recv() {
                let (bytes, context) = result.unwrap();
                assert_eq!(&bytes[..], b"\x55");
                assert_eq!(
                    context.endpoint,
                    Some(sender.source_endpoint().unwrap())
                );
                observed = true;
                break;
            }
        }
        assert!(observed);
    }
}
