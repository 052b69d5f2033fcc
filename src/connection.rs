//! Connections multiplex requests and replies over a single transport.
//!
//! A [`Connection`] is a cheap handle to state shared with a driver task, which owns the read half of
//! the transport, runs the message pump, flushes the send queue and fires timers. Every state change
//! happens under one lock, and callbacks into user code, observer notifications included, run after
//! that lock is released.
//!
//! # Lifecycle
//!
//! ```text
//! not-initialized -> not-validated -> active <-> holding -> closing -> closing-pending -> closed -> finished
//! ```
//!
//! Outgoing connections become active once the server's validate frame is received. Accepted
//! connections send that frame and then hold until [`Connection::activate`] is called.

mod batch;
mod driver;
mod invocation;
mod send_queue;
mod state;

use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use futures::{task::noop_waker_ref, FutureExt};
use parking_lot::{Mutex, MutexGuard};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::{oneshot, watch, Notify},
    time::Instant,
};
use tracing::{debug, trace, warn};

pub use invocation::{CancelHandle, Invocation, InvocationError, InvocationMode, Reply};
pub use send_queue::SendStatus;
pub use state::{CloseMode, State};

use self::{
    batch::BatchRequestQueue,
    invocation::PendingRequest,
    send_queue::{OutgoingMessage, SendQueue},
};
use crate::{
    compress::decompress_frame,
    context::RuntimeContext,
    dispatch::{route, Adapter, DispatchError, DispatchResult, IncomingRequest},
    endpoint::{Connector, Endpoint},
    error::{Error, Result},
    protocol::{
        decode_batch, encode_batch, encode_control, encode_reply, encode_request, read_i32,
        CompressionStatus, Header, MessageType, ReplyStatus, HEADER_SIZE, REPLY_STATUS_OFFSET,
        REQUEST_ID_OFFSET,
    },
    transport::BoxTransport,
};

type Callback = Box<dyn FnOnce(&Connection) + Send>;

/// A connection to a peer.
///
/// Clones share the same connection. Two handles compare equal when they refer to the same
/// connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    id: u64,
    ctx: RuntimeContext,
    endpoint: Endpoint,
    connector: Option<Connector>,
    incoming: bool,
    adapter: ArcSwapOption<Arc<dyn Adapter>>,
    inner: Mutex<Inner>,
    /// Wakes the driver when there is something to write or the read interest changed
    wake: Notify,
    state_tx: watch::Sender<State>,
    batch: BatchRequestQueue,
    /// Transitions not yet reported to the observer
    transitions: Mutex<Vec<(State, State)>>,
    delivering: AtomicBool,
}

struct Inner {
    state: State,
    last_error: Option<Error>,
    writer: Option<WriteHalf<BoxTransport>>,
    needs_flush: bool,
    queue: SendQueue,
    pending: HashMap<i32, PendingRequest>,
    next_request_id: i32,
    dispatch_count: usize,
    upcall_count: usize,
    last_read: Instant,
    last_write: Instant,
    last_activity: Instant,
    close_deadline: Option<Instant>,
    wait_for_pending: bool,
    peer_closed: bool,
    close_queued: bool,
    close_callback: Option<Callback>,
    closed_hooks: Vec<Callback>,
    finished_hooks: Vec<Callback>,
    /// Work to run once the lock is released
    deferred: Vec<Deferred>,
}

enum Deferred {
    Dispatch {
        request_id: i32,
        body: Bytes,
        compress: bool,
    },
    Batch {
        requests: Vec<Bytes>,
        compress: bool,
    },
    Callbacks(Vec<Callback>),
}

impl Connection {
    /// Validates an outgoing connection over an already connected transport.
    ///
    /// Waits for the server's validate frame, bounded by the endpoint's timeout or the configured
    /// connect timeout, and returns an active connection.
    pub async fn connect(
        ctx: &RuntimeContext,
        endpoint: Endpoint,
        connector: Option<Connector>,
        transport: BoxTransport,
    ) -> Result<Connection> {
        let shared = Shared::new(ctx.clone(), endpoint, connector, false);
        Shared::establish(shared, transport).await
    }

    /// Validates an incoming connection by sending the validate frame.
    ///
    /// The returned connection holds: it does not read requests until [`Connection::activate`] is
    /// called.
    pub async fn accept(
        ctx: &RuntimeContext,
        endpoint: Endpoint,
        transport: BoxTransport,
        adapter: Option<Arc<dyn Adapter>>,
    ) -> Result<Connection> {
        let shared = Shared::new(ctx.clone(), endpoint, None, true);
        shared.adapter.store(adapter.map(Arc::new));
        Shared::establish(shared, transport).await
    }

    /// Identifier of the connection, unique within its runtime context.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The endpoint this connection was established for.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// The connector this connection was dialed through, `None` for accepted connections.
    pub fn connector(&self) -> Option<&Connector> {
        self.shared.connector.as_ref()
    }

    /// Returns true for accepted connections.
    pub fn is_incoming(&self) -> bool {
        self.shared.incoming
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    /// The error the connection is closing or closed with.
    pub fn last_error(&self) -> Option<Error> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Sends a request.
    ///
    /// Fails right away, with nothing sent, when the connection no longer accepts requests.
    pub fn invoke(
        &self,
        mode: InvocationMode,
        body: &[u8],
        compress: bool,
    ) -> Result<Invocation> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        Shared::check_usable(&inner)?;

        let request_id = match mode {
            InvocationMode::Twoway => inner.allocate_request_id(),
            InvocationMode::Oneway => 0,
        };
        let mut message =
            OutgoingMessage::new(MessageType::Request, encode_request(request_id, body), compress);
        let message_id = inner.queue.assign_id(&mut message);
        let sent_rx = message.notify_sent();
        let transmitted = message.transmitted();

        let reply_rx = match mode {
            InvocationMode::Twoway => {
                let (reply_tx, reply_rx) = oneshot::channel();
                inner.pending.insert(
                    request_id,
                    PendingRequest {
                        message_id,
                        reply_tx,
                    },
                );
                Some(reply_rx)
            }
            InvocationMode::Oneway => None,
        };
        inner.last_activity = Instant::now();

        let result = shared.enqueue(&mut inner, message);
        shared.release(inner);
        let status = result?;

        Ok(Invocation::new(
            request_id,
            status,
            sent_rx,
            reply_rx,
            transmitted,
            CancelHandle::new(Arc::downgrade(shared), message_id, request_id),
        ))
    }

    /// Sends a two-way request and waits for its reply.
    ///
    /// Compression follows the endpoint's own flag. A connection handed out by a pool should be used
    /// through [`Acquired::request`](crate::Acquired::request) instead, which honors the pool's
    /// compression override.
    pub async fn request(&self, body: &[u8]) -> Result<Reply, InvocationError> {
        self.invoke(InvocationMode::Twoway, body, self.shared.endpoint.compress)
            .map_err(|error| InvocationError { error, sent: false })?
            .await
    }

    /// Queues a one-way request for the next batch.
    ///
    /// The batch is sent by [`Connection::flush_batch`], or automatically once it grows past the
    /// configured auto flush size.
    pub fn batch_request(&self, body: impl Into<Bytes>, compress: bool) -> Result<()> {
        Shared::check_usable(&self.shared.inner.lock())?;
        if let Some(batch) = self.shared.batch.push(body.into(), compress) {
            self.send_batch(batch.requests, batch.compress)?;
        }
        Ok(())
    }

    /// Sends every queued batch request as a single frame.
    ///
    /// Returns `None` when nothing was queued.
    pub fn flush_batch(&self) -> Result<Option<SendStatus>> {
        match self.shared.batch.take() {
            Some(batch) => self.send_batch(batch.requests, batch.compress).map(Some),
            None => Ok(None),
        }
    }

    /// Number of requests waiting in the batch queue.
    pub fn batch_len(&self) -> usize {
        self.shared.batch.len()
    }

    fn send_batch(&self, requests: Vec<Bytes>, compress: bool) -> Result<SendStatus> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        Shared::check_usable(&inner)?;
        let message = OutgoingMessage::new(MessageType::RequestBatch, encode_batch(&requests), compress);
        inner.last_activity = Instant::now();
        let result = shared.enqueue(&mut inner, message);
        shared.release(inner);
        result
    }

    /// Sends a validate frame, resetting the peer's idle timer.
    pub fn heartbeat(&self) -> Result<SendStatus> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        Shared::check_usable(&inner)?;
        let result = shared.enqueue(&mut inner, heartbeat_message());
        shared.release(inner);
        result
    }

    /// Stops reading from the peer until [`Connection::activate`] is called.
    pub fn hold(&self) {
        self.shared.transition(State::Holding);
    }

    /// Starts or resumes reading from the peer.
    pub fn activate(&self) {
        self.shared.transition(State::Active);
    }

    /// Closes the connection.
    pub fn close(&self, mode: CloseMode) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        match mode {
            CloseMode::Forcefully => shared.close_with(
                &mut inner,
                Error::ConnectionClosedLocally { graceful: false },
                State::Closed,
            ),
            CloseMode::Gracefully | CloseMode::GracefullyWithWait => {
                if mode == CloseMode::GracefullyWithWait {
                    inner.wait_for_pending = true;
                }
                shared.close_with(
                    &mut inner,
                    Error::ConnectionClosedLocally { graceful: true },
                    State::Closing,
                );
            }
        }
        shared.release(inner);
    }

    /// Closes the connection gracefully, recording `error` as the cause.
    pub fn close_with(&self, error: Error) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        shared.close_with(&mut inner, error, State::Closing);
        shared.release(inner);
    }

    /// The adapter incoming requests are dispatched to.
    pub fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        self.shared.adapter()
    }

    /// Replaces the adapter incoming requests are dispatched to.
    pub fn set_adapter(&self, adapter: Option<Arc<dyn Adapter>>) {
        self.shared.adapter.store(adapter.map(Arc::new));
    }

    /// Registers a callback fired once the connection is closed.
    ///
    /// Fires right away when the connection is already closed. Replaces any previous callback.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.state >= State::Closed {
            drop(inner);
            callback(self);
            return;
        }
        inner.close_callback = Some(Box::new(callback));
    }

    pub(crate) fn on_closed<F>(&self, hook: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.state >= State::Closed {
            drop(inner);
            hook(self);
            return;
        }
        inner.closed_hooks.push(Box::new(hook));
    }

    pub(crate) fn on_finished<F>(&self, hook: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.state == State::Finished {
            drop(inner);
            hook(self);
            return;
        }
        inner.finished_hooks.push(Box::new(hook));
    }

    /// Number of two-way requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Number of incoming requests being dispatched.
    pub fn dispatch_count(&self) -> usize {
        self.shared.inner.lock().dispatch_count
    }

    /// Number of messages waiting to be written.
    pub fn queued_messages(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.shared.state_tx.subscribe()
    }

    /// Waits until the connection reaches [`State::Finished`].
    pub async fn wait_finished(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == State::Finished).await;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint.to_string())
            .field("incoming", &self.shared.incoming)
            .finish()
    }
}

impl Inner {
    fn new() -> Self {
        let now = Instant::now();
        Inner {
            state: State::NotInitialized,
            last_error: None,
            writer: None,
            needs_flush: false,
            queue: SendQueue::default(),
            pending: HashMap::new(),
            next_request_id: 1,
            dispatch_count: 0,
            upcall_count: 0,
            last_read: now,
            last_write: now,
            last_activity: now,
            close_deadline: None,
            wait_for_pending: false,
            peer_closed: false,
            close_queued: false,
            close_callback: None,
            closed_hooks: Vec::new(),
            finished_hooks: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Returns the next request id, skipping 0 and ids still awaiting a reply.
    fn allocate_request_id(&mut self) -> i32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// The connection has nothing in flight besides possibly one queued message.
    fn is_unused(&self) -> bool {
        self.dispatch_count == 0 && self.pending.is_empty() && self.queue.len() <= 1
    }
}

impl Shared {
    fn new(
        ctx: RuntimeContext,
        endpoint: Endpoint,
        connector: Option<Connector>,
        incoming: bool,
    ) -> Arc<Shared> {
        let (state_tx, _) = watch::channel(State::NotInitialized);
        let batch = BatchRequestQueue::new(ctx.config().batch_auto_flush_size);
        Arc::new(Shared {
            id: ctx.next_connection_id(),
            ctx,
            endpoint,
            connector,
            incoming,
            adapter: ArcSwapOption::empty(),
            inner: Mutex::new(Inner::new()),
            wake: Notify::new(),
            state_tx,
            batch,
            transitions: Mutex::new(Vec::new()),
            delivering: AtomicBool::new(false),
        })
    }

    async fn establish(shared: Arc<Shared>, mut transport: BoxTransport) -> Result<Connection> {
        shared.transition(State::NotValidated);

        let timeout = shared
            .endpoint
            .timeout
            .or(shared.ctx.config().connect_timeout);
        let validation = shared.validate(&mut transport);
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, validation)
                .await
                .unwrap_or(Err(Error::ConnectTimeout)),
            None => validation.await,
        };

        if let Err(err) = result {
            let mut inner = shared.inner.lock();
            shared.close_with(&mut inner, err.clone(), State::Closed);
            shared.set_state(&mut inner, State::Finished);
            shared.release(inner);
            return Err(err);
        }

        let (reader, writer) = tokio::io::split(transport);
        {
            let mut inner = shared.inner.lock();
            let now = Instant::now();
            inner.writer = Some(writer);
            inner.last_read = now;
            inner.last_write = now;
            inner.last_activity = now;
            let next = if shared.incoming {
                State::Holding
            } else {
                State::Active
            };
            shared.set_state(&mut inner, next);
            shared.release(inner);
        }
        debug!(
            connection = shared.id,
            endpoint = %shared.endpoint,
            incoming = shared.incoming,
            "connection established"
        );

        tokio::spawn(driver::run(shared.clone(), reader));
        Ok(Connection { shared })
    }

    /// Runs the validate frame exchange.
    async fn validate(&self, transport: &mut BoxTransport) -> Result<()> {
        if self.endpoint.is_datagram() {
            return Ok(());
        }

        if self.incoming {
            transport
                .write_all(&encode_control(MessageType::ValidateConnection))
                .await?;
            transport.flush().await?;
            self.trace_frame("sent", MessageType::ValidateConnection, HEADER_SIZE);
            return Ok(());
        }

        let mut header = [0u8; HEADER_SIZE];
        transport.read_exact(&mut header).await?;
        let header = Header::decode(&header)?;
        if header.message_type != MessageType::ValidateConnection {
            return Err(Error::Protocol(format!(
                "expected a validate connection message, received {:?}",
                header.message_type
            )));
        }
        if header.size as usize != HEADER_SIZE {
            return Err(Error::IllegalMessageSize(header.size));
        }
        self.trace_frame("received", MessageType::ValidateConnection, HEADER_SIZE);
        Ok(())
    }

    fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        self.adapter.load_full().map(|adapter| (*adapter).clone())
    }

    fn check_usable(inner: &Inner) -> Result<()> {
        if inner.state.is_usable() {
            return Ok(());
        }
        Err(inner.last_error.clone().unwrap_or_else(|| {
            Error::Protocol(format!("connection is {}", inner.state))
        }))
    }

    /// Drops the lock, then runs whatever was deferred while it was held.
    fn release(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner>) {
        let deferred = std::mem::take(&mut inner.deferred);
        drop(inner);
        self.notify_observer();
        if deferred.is_empty() {
            return;
        }

        let connection = Connection {
            shared: self.clone(),
        };
        for work in deferred {
            match work {
                Deferred::Dispatch {
                    request_id,
                    body,
                    compress,
                } => {
                    let request = IncomingRequest {
                        request_id,
                        body,
                        connection: connection.clone(),
                        compress,
                    };
                    let adapter = self.adapter();
                    let shared = self.clone();
                    tokio::spawn(async move {
                        let result = catch_dispatch(adapter, request).await;
                        shared.dispatch_finished(request_id, compress, result);
                    });
                }
                Deferred::Batch { requests, compress } => {
                    let shared = self.clone();
                    let connection = connection.clone();
                    tokio::spawn(async move {
                        for body in requests {
                            let request = IncomingRequest {
                                request_id: 0,
                                body,
                                connection: connection.clone(),
                                compress,
                            };
                            let result = catch_dispatch(shared.adapter(), request).await;
                            shared.dispatch_finished(0, compress, result);
                        }
                    });
                }
                Deferred::Callbacks(callbacks) => {
                    for callback in callbacks {
                        callback(&connection);
                    }
                }
            }
        }
    }

    /// Reports queued transitions to the observer, in order.
    ///
    /// Only one caller delivers at a time; transitions queued meanwhile, including by the observer
    /// itself, are picked up by that caller's loop.
    fn notify_observer(&self) {
        let Some(observer) = self.ctx.observer() else {
            return;
        };
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let transitions = std::mem::take(&mut *self.transitions.lock());
                if transitions.is_empty() {
                    break;
                }
                for (old, new) in transitions {
                    observer.state_changed(self.id, old, new);
                }
            }
            self.delivering.store(false, Ordering::Release);
            if self.transitions.lock().is_empty() {
                return;
            }
        }
    }

    /// Locks, moves to `state` and releases.
    fn transition(self: &Arc<Self>, state: State) {
        let mut inner = self.inner.lock();
        self.set_state(&mut inner, state);
        self.release(inner);
    }

    fn set_state(&self, inner: &mut Inner, state: State) {
        let old = inner.state;
        let mut state = state;
        if state == State::Closing && (self.endpoint.is_datagram() || old < State::Active) {
            state = State::Closed;
        }
        if old == state || !old.can_move_to(state) {
            return;
        }

        inner.state = state;
        if self.ctx.observer().is_some() {
            self.transitions.lock().push((old, state));
        }
        self.state_tx.send_replace(state);
        trace!(connection = self.id, from = %old, to = %state, "state changed");

        match state {
            State::Active | State::Holding => self.wake.notify_one(),
            State::Closing => {
                self.check_close(inner);
                self.wake.notify_one();
            }
            State::ClosingPending => {
                inner.close_deadline = self
                    .ctx
                    .config()
                    .close_timeout
                    .map(|timeout| Instant::now() + timeout);
                self.wake.notify_one();
            }
            State::Closed => self.on_closed(inner),
            State::Finished => {
                let hooks = std::mem::take(&mut inner.finished_hooks);
                inner.deferred.push(Deferred::Callbacks(hooks));
            }
            State::NotInitialized | State::NotValidated => {}
        }
    }

    /// Records `error` as the close cause, if none is recorded yet, and moves towards `state`.
    fn close_with(&self, inner: &mut Inner, error: Error, state: State) {
        if inner.last_error.is_none() {
            if error.is_expected_close() || !self.ctx.config().warn_connections {
                debug!(connection = self.id, endpoint = %self.endpoint, %error, "closing connection");
            } else {
                warn!(connection = self.id, endpoint = %self.endpoint, %error, "closing connection");
            }
            inner.last_error = Some(error);
        }
        self.set_state(inner, state);
    }

    /// Queues the close frame once nothing holds the graceful shutdown back.
    fn check_close(&self, inner: &mut Inner) {
        if inner.state != State::Closing || inner.close_queued || inner.upcall_count > 0 {
            return;
        }
        if inner.wait_for_pending && !inner.pending.is_empty() {
            return;
        }

        inner.close_queued = true;
        let mut message = OutgoingMessage::new(
            MessageType::CloseConnection,
            encode_control(MessageType::CloseConnection),
            false,
        );
        inner.queue.assign_id(&mut message);
        inner.queue.push(message);
        self.wake.notify_one();
    }

    fn on_closed(&self, inner: &mut Inner) {
        inner.close_deadline = None;
        if let Some(mut writer) = inner.writer.take() {
            let mut cx = Context::from_waker(noop_waker_ref());
            let _ = Pin::new(&mut writer).poll_shutdown(&mut cx);
        }

        let error = inner
            .last_error
            .clone()
            .unwrap_or(Error::ConnectionClosedLocally { graceful: false });
        for (_, pending) in inner.pending.drain() {
            pending.resolve(Err(error.clone()));
        }
        for message in inner.queue.drain() {
            message.fail(error.clone());
        }

        let mut callbacks: Vec<Callback> = inner.close_callback.take().into_iter().collect();
        callbacks.append(&mut inner.closed_hooks);
        inner.deferred.push(Deferred::Callbacks(callbacks));
        debug!(connection = self.id, endpoint = %self.endpoint, %error, "connection closed");
        self.wake.notify_one();
    }

    /// Writes `message` right away when the queue is empty, otherwise queues it for the driver.
    fn enqueue(&self, inner: &mut Inner, mut message: OutgoingMessage) -> Result<SendStatus> {
        if message.id == 0 {
            inner.queue.assign_id(&mut message);
        }

        if inner.queue.is_empty() {
            if let Some(writer) = inner.writer.as_mut() {
                if let Err(err) = message.prepare(&self.ctx) {
                    self.close_with(inner, err.clone(), State::Closed);
                    message.fail(err.clone());
                    return Err(err);
                }

                let mut cx = Context::from_waker(noop_waker_ref());
                match message.poll_write(writer, &mut cx) {
                    Poll::Ready(Ok(())) => {
                        inner.needs_flush = true;
                        inner.last_write = Instant::now();
                        self.message_written(inner, message);
                        self.wake.notify_one();
                        return Ok(SendStatus::Sent);
                    }
                    Poll::Ready(Err(err)) => {
                        self.close_with(inner, err.clone(), State::Closed);
                        message.fail(err.clone());
                        return Err(err);
                    }
                    Poll::Pending => {}
                }
            }
        }

        inner.queue.push(message);
        self.wake.notify_one();
        Ok(SendStatus::Queued)
    }

    /// Writes queued messages until the queue is empty or the transport would block.
    fn poll_write_queue(self: &Arc<Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.inner.lock();
        let result = self.flush_locked(&mut inner, cx);
        if let Poll::Ready(Err(err)) = &result {
            self.close_with(&mut inner, err.clone(), State::Closed);
        }
        self.release(inner);
        result.map(|_| ())
    }

    fn flush_locked(&self, inner: &mut Inner, cx: &mut Context<'_>) -> Poll<Result<()>> {
        loop {
            let Some(writer) = inner.writer.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            let Some(head) = inner.queue.head_mut() else {
                if inner.needs_flush {
                    if let Poll::Ready(result) = Pin::new(writer).poll_flush(cx) {
                        inner.needs_flush = false;
                        result?;
                    } else {
                        return Poll::Pending;
                    }
                }
                return Poll::Ready(Ok(()));
            };

            head.prepare(&self.ctx)?;
            match head.poll_write(writer, cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }

            inner.needs_flush = true;
            inner.last_write = Instant::now();
            if let Some(message) = inner.queue.pop() {
                self.message_written(inner, message);
            }
        }
    }

    fn message_written(&self, inner: &mut Inner, message: OutgoingMessage) {
        let message_type = message.message_type;
        self.trace_frame("sent", message_type, message.frame().len());
        debug_assert!(message.is_complete());
        message.complete();

        if message_type == MessageType::CloseConnection {
            self.set_state(inner, State::ClosingPending);
            if inner.peer_closed {
                self.set_state(inner, State::Closed);
            }
        }
    }

    /// Parses and handles every complete message in `buf`.
    ///
    /// Returns true when it stopped with complete messages left because reading was disabled.
    fn process_input(self: &Arc<Self>, buf: &mut BytesMut) -> bool {
        let mut inner = self.inner.lock();
        inner.last_read = Instant::now();
        let mut backlog = false;
        loop {
            if !self.is_reading(&inner) {
                backlog = has_complete_frame(buf);
                break;
            }
            match self.next_frame(buf) {
                Ok(Some((header, frame))) => {
                    if let Err(err) = self.handle_message(&mut inner, header, frame) {
                        self.close_with(&mut inner, err, State::Closed);
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.close_with(&mut inner, err, State::Closed);
                    break;
                }
            }
        }
        self.release(inner);
        backlog
    }

    /// Splits the next complete frame off `buf`, validating the header as soon as enough of it is
    /// buffered.
    fn next_frame(&self, buf: &mut BytesMut) -> Result<Option<(Header, Bytes)>> {
        if buf.len() < HEADER_SIZE {
            Header::check_prefix(buf)?;
            return Ok(None);
        }

        let header = Header::decode(&buf[..HEADER_SIZE])?;
        let size = header.size as usize;
        let max = self.ctx.config().max_message_size;
        if size > max {
            return Err(Error::MessageTooLarge { size, max });
        }
        if buf.len() < size {
            buf.reserve(size - buf.len());
            return Ok(None);
        }
        Ok(Some((header, buf.split_to(size).freeze())))
    }

    fn handle_message(&self, inner: &mut Inner, header: Header, frame: Bytes) -> Result<()> {
        let frame = if header.compression == CompressionStatus::Compressed {
            decompress_frame(
                self.ctx.compressor(),
                &frame,
                self.ctx.config().max_message_size,
            )?
            .freeze()
        } else {
            frame
        };
        let compress = header.compression != CompressionStatus::NotCompressed;
        self.trace_frame("received", header.message_type, frame.len());

        match header.message_type {
            MessageType::CloseConnection => {
                if self.endpoint.is_datagram() {
                    trace!(connection = self.id, "ignoring close connection message on datagram connection");
                } else if inner.state == State::ClosingPending {
                    self.set_state(inner, State::Closed);
                } else {
                    inner.peer_closed = true;
                    self.close_with(inner, Error::ConnectionClosedByPeer, State::Closing);
                }
            }
            MessageType::Request => {
                if inner.state >= State::Closing {
                    trace!(connection = self.id, "ignoring request received while closing");
                    return Ok(());
                }
                let request_id = read_i32(&frame, REQUEST_ID_OFFSET)
                    .ok_or_else(|| Error::Protocol("request is missing its request id".into()))?;
                if request_id < 0 {
                    return Err(Error::Protocol(format!("invalid request id {request_id}")));
                }
                inner.dispatch_count += 1;
                inner.upcall_count += 1;
                inner.last_activity = Instant::now();
                inner.deferred.push(Deferred::Dispatch {
                    request_id,
                    body: frame.slice(REQUEST_ID_OFFSET + 4..),
                    compress,
                });
            }
            MessageType::RequestBatch => {
                if inner.state >= State::Closing {
                    trace!(connection = self.id, "ignoring batch request received while closing");
                    return Ok(());
                }
                let requests = decode_batch(&frame)?;
                if requests.is_empty() {
                    return Ok(());
                }
                inner.dispatch_count += requests.len();
                inner.upcall_count += requests.len();
                inner.last_activity = Instant::now();
                inner.deferred.push(Deferred::Batch { requests, compress });
            }
            MessageType::Reply => {
                let request_id = read_i32(&frame, REQUEST_ID_OFFSET)
                    .ok_or_else(|| Error::Protocol("reply is missing its request id".into()))?;
                let status = frame
                    .get(REPLY_STATUS_OFFSET)
                    .copied()
                    .ok_or_else(|| Error::Protocol("reply is missing its status".into()))
                    .and_then(ReplyStatus::try_from)?;
                match inner.pending.remove(&request_id) {
                    Some(pending) => {
                        inner.last_activity = Instant::now();
                        pending.resolve(Ok(Reply {
                            status,
                            body: frame.slice(REPLY_STATUS_OFFSET + 1..),
                        }));
                        self.check_close(inner);
                    }
                    None => {
                        trace!(connection = self.id, request_id, "discarding reply for unknown request");
                    }
                }
            }
            MessageType::ValidateConnection => {
                trace!(connection = self.id, "received heartbeat");
            }
        }
        Ok(())
    }

    fn dispatch_finished(self: &Arc<Self>, request_id: i32, compress: bool, result: DispatchResult) {
        let mut inner = self.inner.lock();
        inner.dispatch_count -= 1;
        inner.upcall_count -= 1;
        inner.last_activity = Instant::now();

        if request_id != 0 && inner.state < State::ClosingPending {
            let (status, body) = match result {
                Ok(body) => (ReplyStatus::Ok, body),
                Err(err) => (err.status, Bytes::from(err.message.into_bytes())),
            };
            let reply = OutgoingMessage::new(
                MessageType::Reply,
                encode_reply(request_id, status, &body),
                compress,
            );
            if let Err(err) = self.enqueue(&mut inner, reply) {
                trace!(connection = self.id, request_id, %err, "reply not sent");
            }
        }

        self.check_close(&mut inner);
        self.wake.notify_one();
        self.release(inner);
    }

    fn cancel(self: &Arc<Self>, message_id: u64, request_id: i32, error: Error) {
        let mut inner = self.inner.lock();
        if request_id != 0
            && inner
                .pending
                .get(&request_id)
                .is_some_and(|pending| pending.message_id == message_id)
        {
            if let Some(pending) = inner.pending.remove(&request_id) {
                pending.resolve(Err(error.clone()));
            }
        }

        match inner.queue.remove_unsent(message_id) {
            Some(Ok(message)) => message.fail(error.clone()),
            Some(Err(head)) => head.detach(error.clone()),
            None => {}
        }

        if matches!(error, Error::InvocationCanceled | Error::InvocationTimeout(_)) {
            self.check_close(&mut inner);
        } else {
            self.close_with(&mut inner, error, State::Closed);
        }
        self.release(inner);
    }

    fn on_eof(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state == State::ClosingPending {
            self.set_state(&mut inner, State::Closed);
        } else {
            self.close_with(
                &mut inner,
                Error::ConnectionLost("peer closed the connection".into()),
                State::Closed,
            );
        }
        self.release(inner);
    }

    fn fail(self: &Arc<Self>, error: Error) {
        let mut inner = self.inner.lock();
        self.close_with(&mut inner, error, State::Closed);
        self.release(inner);
    }

    fn on_timer(self: &Arc<Self>, now: Instant) {
        let mut inner = self.inner.lock();
        let config = self.ctx.config();
        let state = inner.state;
        match state {
            State::ClosingPending => {
                if inner.close_deadline.is_some_and(|deadline| now >= deadline) {
                    let timeout = config.close_timeout.unwrap_or_default();
                    self.close_with(&mut inner, Error::CloseTimeout(timeout), State::Closed);
                }
            }
            State::Active | State::Closing => {
                if let Some(idle) = config.idle_timeout {
                    if now >= inner.last_read + idle {
                        self.close_with(&mut inner, Error::ConnectionIdle(idle), State::Closed);
                        self.release(inner);
                        return;
                    }
                }
                if state != State::Active {
                    self.release(inner);
                    return;
                }

                if let Some(inactivity) = config.inactivity_timeout {
                    if now >= inner.last_activity + inactivity {
                        if inner.is_unused() {
                            self.close_with(
                                &mut inner,
                                Error::ConnectionInactive(inactivity),
                                State::Closing,
                            );
                            self.release(inner);
                            return;
                        }
                        inner.last_activity = now;
                    }
                }

                if let Some(interval) = config.heartbeat_interval() {
                    if inner.queue.is_empty() && now >= inner.last_write + interval {
                        trace!(connection = self.id, "sending heartbeat");
                        inner.last_write = now;
                        let _ = self.enqueue(&mut inner, heartbeat_message());
                    }
                }
            }
            _ => {}
        }
        self.release(inner);
    }

    fn is_reading(&self, inner: &Inner) -> bool {
        let max = self.ctx.config().max_dispatches;
        matches!(
            inner.state,
            State::Active | State::Closing | State::ClosingPending
        ) && (max == 0 || inner.dispatch_count < max)
    }

    /// The earliest instant a timer needs to be checked.
    fn next_deadline(&self, inner: &Inner) -> Option<Instant> {
        let config = self.ctx.config();
        let mut deadlines: Vec<Instant> = Vec::with_capacity(3);
        match inner.state {
            State::ClosingPending => deadlines.extend(inner.close_deadline),
            State::Active | State::Closing => {
                if let Some(idle) = config.idle_timeout {
                    deadlines.push(inner.last_read + idle);
                }
                if inner.state == State::Active {
                    if let Some(inactivity) = config.inactivity_timeout {
                        deadlines.push(inner.last_activity + inactivity);
                    }
                    if let Some(interval) = config.heartbeat_interval() {
                        if inner.queue.is_empty() {
                            deadlines.push(inner.last_write + interval);
                        }
                    }
                }
            }
            _ => {}
        }
        deadlines.into_iter().min()
    }

    fn upcalls(&self) -> usize {
        self.inner.lock().upcall_count
    }

    fn trace_frame(&self, direction: &'static str, message_type: MessageType, size: usize) {
        if self.ctx.trace_protocol() {
            trace!(
                connection = self.id,
                endpoint = %self.endpoint,
                direction,
                message_type = ?message_type,
                size,
                "protocol"
            );
        }
    }
}

fn heartbeat_message() -> OutgoingMessage {
    OutgoingMessage::new(
        MessageType::ValidateConnection,
        encode_control(MessageType::ValidateConnection),
        false,
    )
}

fn has_complete_frame(buf: &[u8]) -> bool {
    read_i32(buf, 10).is_some_and(|size| size >= HEADER_SIZE as i32 && buf.len() >= size as usize)
}

async fn catch_dispatch(adapter: Option<Arc<dyn Adapter>>, request: IncomingRequest) -> DispatchResult {
    AssertUnwindSafe(route(adapter, request))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(DispatchError::unknown("dispatch panicked")))
}
