//! Servant dispatch for incoming requests.

use std::{fmt, future::Future, sync::Arc};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};

use crate::{connection::Connection, protocol::ReplyStatus};

/// The outcome of dispatching a request: the reply body, or a failure status.
pub type DispatchResult = Result<Bytes, DispatchError>;

/// Routes incoming requests to servants.
///
/// An adapter is installed on a connection with [`Connection::set_adapter`]. Requests arriving on a
/// connection without one are answered with [`ReplyStatus::ObjectNotExist`].
pub trait Adapter: Send + Sync + 'static {
    /// Name of the adapter, used to detach it from connections when it is deactivated.
    fn name(&self) -> &str;

    /// Dispatches a single request.
    ///
    /// The reply of a two-way request is sent once the returned future completes. The result of a
    /// one-way request is discarded.
    fn dispatch(&self, request: IncomingRequest) -> BoxFuture<'static, DispatchResult>;
}

/// A request received from the peer.
#[derive(Clone, Debug)]
pub struct IncomingRequest {
    /// 0 for one-way requests
    pub request_id: i32,
    /// Encapsulated request payload, following the request id
    pub body: Bytes,
    /// The connection the request arrived on
    pub connection: Connection,
    /// The peer asked for a compressed reply
    pub compress: bool,
}

impl IncomingRequest {
    /// Returns true when no reply is expected.
    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }
}

/// A failed dispatch, sent back to the caller as a non-ok reply status.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{status:?}: {message}")]
pub struct DispatchError {
    /// Status sent in the reply, never [`ReplyStatus::Ok`]
    pub status: ReplyStatus,
    /// Sent as the reply body
    pub message: String,
}

impl DispatchError {
    /// A failure with an arbitrary status.
    pub fn new(status: ReplyStatus, message: impl Into<String>) -> Self {
        DispatchError {
            status,
            message: message.into(),
        }
    }

    /// The target object is unknown to the adapter.
    pub fn object_not_exist(message: impl Into<String>) -> Self {
        DispatchError::new(ReplyStatus::ObjectNotExist, message)
    }

    /// The object has no such operation.
    pub fn operation_not_exist(message: impl Into<String>) -> Self {
        DispatchError::new(ReplyStatus::OperationNotExist, message)
    }

    /// The servant raised an application level error.
    pub fn user_exception(message: impl Into<String>) -> Self {
        DispatchError::new(ReplyStatus::UserException, message)
    }

    /// The servant failed unexpectedly.
    pub fn unknown(message: impl Into<String>) -> Self {
        DispatchError::new(ReplyStatus::UnknownException, message)
    }
}

/// Dispatches `request` through `adapter`, or fails it when no adapter is installed.
pub(crate) fn route(
    adapter: Option<Arc<dyn Adapter>>,
    request: IncomingRequest,
) -> BoxFuture<'static, DispatchResult> {
    match adapter {
        Some(adapter) => adapter.dispatch(request),
        None => futures::future::ready(Err(DispatchError::object_not_exist(
            "no adapter is associated with the connection",
        )))
        .boxed(),
    }
}

/// An [`Adapter`] backed by an async closure.
pub struct AdapterFn<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for AdapterFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterFn").field("name", &self.name).finish()
    }
}

/// Creates an adapter from an async closure.
///
/// ```
/// use tether::dispatch::{adapter_fn, Adapter};
///
/// let echo = adapter_fn("echo", |req| async move { Ok(req.body) });
/// assert_eq!(echo.name(), "echo");
/// ```
pub fn adapter_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Adapter>
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    Arc::new(AdapterFn {
        name: name.into(),
        f,
    })
}

impl<F, Fut> Adapter for AdapterFn<F>
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, request: IncomingRequest) -> BoxFuture<'static, DispatchResult> {
        (self.f)(request).boxed()
    }
}
