//! Defines error handling constructs for tether.
//!
//! Every failure in the connection layer is described by a single closed [`Error`] enum. Each variant
//! maps to an [`ErrorKind`], which carries a stable string identifier suitable for putting on the wire,
//! and to an [`ErrorCategory`] which drives the retry and logging decisions made by connections and the
//! pool.

use std::{fmt, io, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::protocol::ReplyStatus;

/// A specialized `Result` type for tether operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error that can occur while establishing, using or tearing down a connection.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An operating system level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The remote actively refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Establishing the connection (dial and validation) took longer than allowed.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The transport could not be connected.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// An endpoint host could not be resolved.
    #[error("failed to resolve `{host}`: {reason}")]
    DnsFailed {
        /// The host that failed to resolve.
        host: String,
        /// Resolver supplied reason.
        reason: String,
    },

    /// The transport was lost while the connection was in use.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A frame did not start with the protocol magic.
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// The peer speaks an unsupported protocol version.
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocol {
        /// Major version sent by the peer.
        major: u8,
        /// Minor version sent by the peer.
        minor: u8,
    },

    /// The peer uses an unsupported protocol encoding version.
    #[error("unsupported encoding version {major}.{minor}")]
    UnsupportedEncoding {
        /// Major version sent by the peer.
        major: u8,
        /// Minor version sent by the peer.
        minor: u8,
    },

    /// A frame declared a size smaller than the header or otherwise impossible.
    #[error("illegal message size {0}")]
    IllegalMessageSize(i32),

    /// A frame exceeded the configured maximum message size.
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge {
        /// Declared message size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A frame carried an unknown message type.
    #[error("unknown message type {0}")]
    UnknownMessage(u8),

    /// The peer relies on a feature this side does not provide, such as compression.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Any other framing violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed by its owner.
    #[error("connection closed locally ({})", close_mode(.graceful))]
    ConnectionClosedLocally {
        /// Whether the close went through the graceful handshake.
        graceful: bool,
    },

    /// The peer sent a close-connection frame.
    #[error("connection closed by peer")]
    ConnectionClosedByPeer,

    /// The owning runtime or pool is shutting down.
    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    /// The object adapter bound to the connection was deactivated.
    #[error("object adapter `{0}` deactivated")]
    AdapterDeactivated(String),

    /// No bytes were received within the idle timeout.
    #[error("connection idle: no data received for {0:?}")]
    ConnectionIdle(Duration),

    /// The connection was not used within the inactivity timeout.
    #[error("connection closed due to inactivity after {0:?}")]
    ConnectionInactive(Duration),

    /// The peer did not acknowledge a graceful close in time.
    #[error("graceful close timed out after {0:?}")]
    CloseTimeout(Duration),

    /// The remote dispatch failed and replied with a failure status.
    #[error("dispatch failed with {status:?}: {message}")]
    Dispatch {
        /// Reply status sent by the peer.
        status: ReplyStatus,
        /// Failure description sent by the peer.
        message: String,
    },

    /// The caller cancelled the invocation.
    #[error("invocation canceled")]
    InvocationCanceled,

    /// The caller gave up waiting for a reply.
    #[error("invocation timed out after {0:?}")]
    InvocationTimeout(Duration),

    /// An endpoint string could not be parsed.
    #[error("invalid endpoint `{input}`: {reason}")]
    EndpointParse {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// `acquire` was called without any endpoint.
    #[error("no endpoint available")]
    NoEndpoint,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The discriminant of an [`Error`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`Error::Io`].
    Io,
    /// See [`Error::ConnectionRefused`].
    ConnectionRefused,
    /// See [`Error::ConnectTimeout`].
    ConnectTimeout,
    /// See [`Error::ConnectFailed`].
    ConnectFailed,
    /// See [`Error::DnsFailed`].
    DnsFailed,
    /// See [`Error::ConnectionLost`].
    ConnectionLost,
    /// See [`Error::BadMagic`].
    BadMagic,
    /// See [`Error::UnsupportedProtocol`].
    UnsupportedProtocol,
    /// See [`Error::UnsupportedEncoding`].
    UnsupportedEncoding,
    /// See [`Error::IllegalMessageSize`].
    IllegalMessageSize,
    /// See [`Error::MessageTooLarge`].
    MessageTooLarge,
    /// See [`Error::UnknownMessage`].
    UnknownMessage,
    /// See [`Error::FeatureNotSupported`].
    FeatureNotSupported,
    /// See [`Error::Protocol`].
    Protocol,
    /// See [`Error::ConnectionClosedLocally`].
    ConnectionClosedLocally,
    /// See [`Error::ConnectionClosedByPeer`].
    ConnectionClosedByPeer,
    /// See [`Error::CommunicatorDestroyed`].
    CommunicatorDestroyed,
    /// See [`Error::AdapterDeactivated`].
    AdapterDeactivated,
    /// See [`Error::ConnectionIdle`].
    ConnectionIdle,
    /// See [`Error::ConnectionInactive`].
    ConnectionInactive,
    /// See [`Error::CloseTimeout`].
    CloseTimeout,
    /// See [`Error::Dispatch`].
    Dispatch,
    /// See [`Error::InvocationCanceled`].
    InvocationCanceled,
    /// See [`Error::InvocationTimeout`].
    InvocationTimeout,
    /// See [`Error::EndpointParse`].
    EndpointParse,
    /// See [`Error::NoEndpoint`].
    NoEndpoint,
    /// See [`Error::InvalidConfig`].
    InvalidConfig,
}

/// Broad classification of error kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Socket or OS failures, fatal to one connector attempt.
    Transport,
    /// Framing violations, fatal to the connection.
    Protocol,
    /// Expected shutdown causes.
    Graceful,
    /// Failures reported by the remote application, carried in a reply.
    Application,
    /// Failures caused by the caller of an invocation.
    Invocation,
    /// Invalid input or configuration.
    Configuration,
}

const ALL_KINDS: &[ErrorKind] = &[
    ErrorKind::Io,
    ErrorKind::ConnectionRefused,
    ErrorKind::ConnectTimeout,
    ErrorKind::ConnectFailed,
    ErrorKind::DnsFailed,
    ErrorKind::ConnectionLost,
    ErrorKind::BadMagic,
    ErrorKind::UnsupportedProtocol,
    ErrorKind::UnsupportedEncoding,
    ErrorKind::IllegalMessageSize,
    ErrorKind::MessageTooLarge,
    ErrorKind::UnknownMessage,
    ErrorKind::FeatureNotSupported,
    ErrorKind::Protocol,
    ErrorKind::ConnectionClosedLocally,
    ErrorKind::ConnectionClosedByPeer,
    ErrorKind::CommunicatorDestroyed,
    ErrorKind::AdapterDeactivated,
    ErrorKind::ConnectionIdle,
    ErrorKind::ConnectionInactive,
    ErrorKind::CloseTimeout,
    ErrorKind::Dispatch,
    ErrorKind::InvocationCanceled,
    ErrorKind::InvocationTimeout,
    ErrorKind::EndpointParse,
    ErrorKind::NoEndpoint,
    ErrorKind::InvalidConfig,
];

impl ErrorKind {
    /// Returns the stable identifier used when an error kind crosses the wire.
    pub const fn id(self) -> &'static str {
        match self {
            ErrorKind::Io => "::tether::Io",
            ErrorKind::ConnectionRefused => "::tether::ConnectionRefused",
            ErrorKind::ConnectTimeout => "::tether::ConnectTimeout",
            ErrorKind::ConnectFailed => "::tether::ConnectFailed",
            ErrorKind::DnsFailed => "::tether::DnsFailed",
            ErrorKind::ConnectionLost => "::tether::ConnectionLost",
            ErrorKind::BadMagic => "::tether::BadMagic",
            ErrorKind::UnsupportedProtocol => "::tether::UnsupportedProtocol",
            ErrorKind::UnsupportedEncoding => "::tether::UnsupportedEncoding",
            ErrorKind::IllegalMessageSize => "::tether::IllegalMessageSize",
            ErrorKind::MessageTooLarge => "::tether::MessageTooLarge",
            ErrorKind::UnknownMessage => "::tether::UnknownMessage",
            ErrorKind::FeatureNotSupported => "::tether::FeatureNotSupported",
            ErrorKind::Protocol => "::tether::Protocol",
            ErrorKind::ConnectionClosedLocally => "::tether::ConnectionClosedLocally",
            ErrorKind::ConnectionClosedByPeer => "::tether::ConnectionClosedByPeer",
            ErrorKind::CommunicatorDestroyed => "::tether::CommunicatorDestroyed",
            ErrorKind::AdapterDeactivated => "::tether::AdapterDeactivated",
            ErrorKind::ConnectionIdle => "::tether::ConnectionIdle",
            ErrorKind::ConnectionInactive => "::tether::ConnectionInactive",
            ErrorKind::CloseTimeout => "::tether::CloseTimeout",
            ErrorKind::Dispatch => "::tether::Dispatch",
            ErrorKind::InvocationCanceled => "::tether::InvocationCanceled",
            ErrorKind::InvocationTimeout => "::tether::InvocationTimeout",
            ErrorKind::EndpointParse => "::tether::EndpointParse",
            ErrorKind::NoEndpoint => "::tether::NoEndpoint",
            ErrorKind::InvalidConfig => "::tether::InvalidConfig",
        }
    }

    /// Looks up a kind from its stable identifier.
    pub fn from_id(id: &str) -> Option<ErrorKind> {
        ALL_KINDS.iter().copied().find(|kind| kind.id() == id)
    }

    /// Returns the category this kind belongs to.
    pub const fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::Io
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectTimeout
            | ErrorKind::ConnectFailed
            | ErrorKind::DnsFailed
            | ErrorKind::ConnectionLost => ErrorCategory::Transport,
            ErrorKind::BadMagic
            | ErrorKind::UnsupportedProtocol
            | ErrorKind::UnsupportedEncoding
            | ErrorKind::IllegalMessageSize
            | ErrorKind::MessageTooLarge
            | ErrorKind::UnknownMessage
            | ErrorKind::FeatureNotSupported
            | ErrorKind::Protocol => ErrorCategory::Protocol,
            ErrorKind::ConnectionClosedLocally
            | ErrorKind::ConnectionClosedByPeer
            | ErrorKind::CommunicatorDestroyed
            | ErrorKind::AdapterDeactivated
            | ErrorKind::ConnectionIdle
            | ErrorKind::ConnectionInactive
            | ErrorKind::CloseTimeout => ErrorCategory::Graceful,
            ErrorKind::Dispatch => ErrorCategory::Application,
            ErrorKind::InvocationCanceled | ErrorKind::InvocationTimeout => {
                ErrorCategory::Invocation
            }
            ErrorKind::EndpointParse | ErrorKind::NoEndpoint | ErrorKind::InvalidConfig => {
                ErrorCategory::Configuration
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl Error {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            Error::ConnectTimeout => ErrorKind::ConnectTimeout,
            Error::ConnectFailed(_) => ErrorKind::ConnectFailed,
            Error::DnsFailed { .. } => ErrorKind::DnsFailed,
            Error::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Error::BadMagic(_) => ErrorKind::BadMagic,
            Error::UnsupportedProtocol { .. } => ErrorKind::UnsupportedProtocol,
            Error::UnsupportedEncoding { .. } => ErrorKind::UnsupportedEncoding,
            Error::IllegalMessageSize(_) => ErrorKind::IllegalMessageSize,
            Error::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Error::UnknownMessage(_) => ErrorKind::UnknownMessage,
            Error::FeatureNotSupported(_) => ErrorKind::FeatureNotSupported,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::ConnectionClosedLocally { .. } => ErrorKind::ConnectionClosedLocally,
            Error::ConnectionClosedByPeer => ErrorKind::ConnectionClosedByPeer,
            Error::CommunicatorDestroyed => ErrorKind::CommunicatorDestroyed,
            Error::AdapterDeactivated(_) => ErrorKind::AdapterDeactivated,
            Error::ConnectionIdle(_) => ErrorKind::ConnectionIdle,
            Error::ConnectionInactive(_) => ErrorKind::ConnectionInactive,
            Error::CloseTimeout(_) => ErrorKind::CloseTimeout,
            Error::Dispatch { .. } => ErrorKind::Dispatch,
            Error::InvocationCanceled => ErrorKind::InvocationCanceled,
            Error::InvocationTimeout(_) => ErrorKind::InvocationTimeout,
            Error::EndpointParse { .. } => ErrorKind::EndpointParse,
            Error::NoEndpoint => ErrorKind::NoEndpoint,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Returns the category of this error.
    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    /// Returns true if this error is an expected shutdown cause which should not be warned about.
    pub fn is_expected_close(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionClosedLocally
                | ErrorKind::ConnectionClosedByPeer
                | ErrorKind::CommunicatorDestroyed
                | ErrorKind::AdapterDeactivated
                | ErrorKind::ConnectionIdle
                | ErrorKind::ConnectionInactive
        )
    }

    /// Returns true if an invocation that failed with this error may be retried on a fresh connection.
    ///
    /// `sent` tells whether any byte of the request reached the transport. A request which never left
    /// the process is always safe to retry, unless the failure is final for the whole runtime or was
    /// caused by the caller. Once bytes were written, only closes known to happen between requests are
    /// safe.
    pub fn is_retryable(&self, sent: bool) -> bool {
        match self.category() {
            ErrorCategory::Application
            | ErrorCategory::Invocation
            | ErrorCategory::Configuration => false,
            _ if self.kind() == ErrorKind::CommunicatorDestroyed => false,
            _ if !sent => true,
            _ => matches!(
                self.kind(),
                ErrorKind::ConnectionIdle
                    | ErrorKind::ConnectionInactive
                    | ErrorKind::ConnectionClosedByPeer
                    | ErrorKind::ConnectionClosedLocally
            ),
        }
    }
}

fn close_mode(graceful: &bool) -> &'static str {
    if *graceful {
        "gracefully"
    } else {
        "forcefully"
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(err.to_string()),
            io::ErrorKind::TimedOut => Error::ConnectTimeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::ConnectionLost(err.to_string()),
            _ => Error::Io(Arc::new(err)),
        }
    }
}
