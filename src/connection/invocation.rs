use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::{ready, Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::oneshot;

use super::{send_queue::SendStatus, Shared};
use crate::{
    error::{Error, Result},
    protocol::ReplyStatus,
};

/// Whether an invocation expects a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    /// Gets a request id and waits for a reply
    Twoway,
    /// Sent with request id 0, completes once written
    Oneway,
}

/// A reply received for a two-way invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Outcome reported by the peer
    pub status: ReplyStatus,
    /// Reply payload, or the failure message for non-ok statuses
    pub body: Bytes,
}

impl Reply {
    pub(crate) fn empty() -> Self {
        Reply {
            status: ReplyStatus::Ok,
            body: Bytes::new(),
        }
    }

    /// Returns the body of a successful reply, or the failure the servant reported.
    pub fn into_result(self) -> Result<Bytes> {
        match self.status {
            ReplyStatus::Ok => Ok(self.body),
            status => Err(Error::Dispatch {
                status,
                message: String::from_utf8_lossy(&self.body).into_owned(),
            }),
        }
    }
}

/// An invocation failure, along with whether any of the request reached the transport.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{error}")]
pub struct InvocationError {
    /// What went wrong
    #[source]
    pub error: Error,
    /// Whether any byte of the request reached the transport
    pub sent: bool,
}

impl InvocationError {
    /// Returns true if the invocation can safely be retried on another connection.
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable(self.sent)
    }

    /// Returns true if any byte of the request reached the transport.
    pub fn was_sent(&self) -> bool {
        self.sent
    }

    /// Discards the sent flag.
    pub fn into_error(self) -> Error {
        self.error
    }
}

/// Bookkeeping for a two-way request awaiting its reply.
pub(crate) struct PendingRequest {
    pub(crate) message_id: u64,
    pub(crate) reply_tx: oneshot::Sender<Result<Reply>>,
}

impl PendingRequest {
    pub(crate) fn resolve(self, result: Result<Reply>) {
        let _ = self.reply_tx.send(result);
    }
}

/// An outstanding request.
///
/// Resolves with the reply of a two-way request, or once a one-way request is written. Dropping an
/// unresolved invocation cancels it.
#[must_use = "dropping an invocation cancels it"]
pub struct Invocation {
    request_id: i32,
    status: SendStatus,
    sent_rx: Option<oneshot::Receiver<Result<()>>>,
    sent_outcome: Option<Result<()>>,
    reply_rx: Option<oneshot::Receiver<Result<Reply>>>,
    transmitted: Arc<AtomicBool>,
    cancel: CancelHandle,
    done: bool,
}

impl Invocation {
    pub(crate) fn new(
        request_id: i32,
        status: SendStatus,
        sent_rx: oneshot::Receiver<Result<()>>,
        reply_rx: Option<oneshot::Receiver<Result<Reply>>>,
        transmitted: Arc<AtomicBool>,
        cancel: CancelHandle,
    ) -> Self {
        Invocation {
            request_id,
            status,
            sent_rx: Some(sent_rx),
            sent_outcome: None,
            reply_rx,
            transmitted,
            cancel,
            done: false,
        }
    }

    /// The request id, 0 for one-way requests.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// Whether the request was fully written before the invocation was returned.
    pub fn send_status(&self) -> SendStatus {
        self.status
    }

    /// Returns true if no reply is expected.
    pub fn is_oneway(&self) -> bool {
        self.reply_rx.is_none()
    }

    /// Waits until the request is fully written to the transport.
    pub async fn sent(&mut self) -> Result<()> {
        if let Some(outcome) = &self.sent_outcome {
            return outcome.clone();
        }
        let outcome = match self.sent_rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::InvocationCanceled)),
            None => Err(Error::InvocationCanceled),
        };
        self.sent_outcome = Some(outcome.clone());
        outcome
    }

    /// Returns a handle that cancels this invocation from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancels the invocation. Awaiting it afterwards yields [`Error::InvocationCanceled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the invocation, canceling it with [`Error::InvocationTimeout`] when `timeout` elapses.
    pub async fn timeout(mut self, timeout: Duration) -> Result<Reply, InvocationError> {
        match tokio::time::timeout(timeout, &mut self).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel.cancel_with(Error::InvocationTimeout(timeout));
                self.done = true;
                Err(InvocationError {
                    error: Error::InvocationTimeout(timeout),
                    sent: self.transmitted.load(Ordering::Acquire),
                })
            }
        }
    }

    fn fail(&self, error: Error) -> InvocationError {
        InvocationError {
            error,
            sent: self.transmitted.load(Ordering::Acquire),
        }
    }
}

impl Future for Invocation {
    type Output = Result<Reply, InvocationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let result = if let Some(reply_rx) = &mut this.reply_rx {
            ready!(Pin::new(reply_rx).poll(cx)).unwrap_or(Err(Error::InvocationCanceled))
        } else if let Some(sent_rx) = &mut this.sent_rx {
            let outcome = ready!(Pin::new(sent_rx).poll(cx)).unwrap_or(Err(Error::InvocationCanceled));
            this.sent_rx = None;
            outcome.map(|()| Reply::empty())
        } else {
            this.sent_outcome
                .clone()
                .unwrap_or(Err(Error::InvocationCanceled))
                .map(|()| Reply::empty())
        };

        this.done = true;
        Poll::Ready(result.map_err(|err| this.fail(err)))
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("request_id", &self.request_id)
            .field("status", &self.status)
            .field("done", &self.done)
            .finish()
    }
}

/// Cancels an outstanding invocation.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Weak<Shared>,
    message_id: u64,
    request_id: i32,
}

impl CancelHandle {
    pub(crate) fn new(shared: Weak<Shared>, message_id: u64, request_id: i32) -> Self {
        CancelHandle {
            shared,
            message_id,
            request_id,
        }
    }

    /// Cancels the invocation with [`Error::InvocationCanceled`].
    pub fn cancel(&self) {
        self.cancel_with(Error::InvocationCanceled);
    }

    /// Cancels the invocation with `error`.
    ///
    /// Errors other than [`Error::InvocationCanceled`] and [`Error::InvocationTimeout`] are treated as
    /// fatal for the whole connection, which is closed with them.
    pub fn cancel_with(&self, error: Error) {
        if let Some(shared) = self.shared.upgrade() {
            Shared::cancel(&shared, self.message_id, self.request_id, error);
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("message_id", &self.message_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}
