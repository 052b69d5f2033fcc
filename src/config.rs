//! Connection and pool settings, deserializable from any serde format.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default timeout for establishing and validating an outgoing connection
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default time to wait for the peer to close after our close frame was written
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 10;

/// Default time without received bytes before a connection is considered dead
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Default time without dispatches or pending requests before a connection is closed gracefully
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 300;

/// Default maximum size of a single message, header included
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Bodies smaller than this are never compressed
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 100;

/// Default size at which a batch queue flushes itself
pub const DEFAULT_BATCH_AUTO_FLUSH_SIZE: usize = 1024 * 1024;

/// Per-connection settings.
///
/// Timeouts set to `None` are disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on dial plus validation for outgoing connections
    pub connect_timeout: Option<Duration>,
    /// Bound on waiting for the peer to close once our close frame is out
    pub close_timeout: Option<Duration>,
    /// Close the connection when nothing was received for this long
    pub idle_timeout: Option<Duration>,
    /// Close the connection gracefully when it was unused for this long
    pub inactivity_timeout: Option<Duration>,
    /// Send a validate frame every `idle_timeout / 2` so the peer does not consider us idle
    pub heartbeats: bool,
    /// Messages announcing a larger size fail the connection
    pub max_message_size: usize,
    /// Minimum body size for compression
    pub compression_threshold: usize,
    /// Stop reading while this many dispatches are in flight. 0 means unlimited.
    pub max_dispatches: usize,
    /// Flush a batch queue once its frame would exceed this size. `None` disables auto flush.
    pub batch_auto_flush_size: Option<usize>,
    /// Log unexpected connection closes at warn level
    pub warn_connections: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: Some(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)),
            close_timeout: Some(Duration::from_secs(DEFAULT_CLOSE_TIMEOUT_SECS)),
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            inactivity_timeout: Some(Duration::from_secs(DEFAULT_INACTIVITY_TIMEOUT_SECS)),
            heartbeats: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_dispatches: 0,
            batch_auto_flush_size: Some(DEFAULT_BATCH_AUTO_FLUSH_SIZE),
            warn_connections: false,
        }
    }
}

impl ConnectionConfig {
    /// Sets the bound on dial plus validation for outgoing connections.
    pub fn with_connect_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.connect_timeout = timeout.into();
        self
    }

    /// Sets how long to wait for the peer's close once ours is written.
    pub fn with_close_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.close_timeout = timeout.into();
        self
    }

    /// Sets how long a connection may go without receiving anything.
    pub fn with_idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.idle_timeout = timeout.into();
        self
    }

    /// Sets how long a connection may sit unused before it is closed gracefully.
    pub fn with_inactivity_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.inactivity_timeout = timeout.into();
        self
    }

    /// Enables or disables heartbeats.
    pub fn with_heartbeats(mut self, enabled: bool) -> Self {
        self.heartbeats = enabled;
        self
    }

    /// Sets the largest message accepted from the peer, header included.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the smallest body size worth compressing.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Limits the number of dispatches in flight before reading pauses. 0 means unlimited.
    pub fn with_max_dispatches(mut self, max: usize) -> Self {
        self.max_dispatches = max;
        self
    }

    /// Sets the batch size that triggers an automatic flush.
    pub fn with_batch_auto_flush_size(mut self, size: impl Into<Option<usize>>) -> Self {
        self.batch_auto_flush_size = size.into();
        self
    }

    /// Logs unexpected closes at warn instead of debug level.
    pub fn with_warn_connections(mut self, warn: bool) -> Self {
        self.warn_connections = warn;
        self
    }

    /// Interval between heartbeats, if heartbeats are enabled and an idle timeout is set.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        if !self.heartbeats {
            return None;
        }
        self.idle_timeout.map(|idle| idle / 2)
    }

    /// Rejects settings the connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size < crate::protocol::HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_message_size {} is smaller than a message header",
                self.max_message_size
            )));
        }
        if self.max_message_size > i32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_message_size {} does not fit the header size field",
                self.max_message_size
            )));
        }
        for (name, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("close_timeout", self.close_timeout),
            ("idle_timeout", self.idle_timeout),
            ("inactivity_timeout", self.inactivity_timeout),
        ] {
            if timeout == Some(Duration::ZERO) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be positive, use None to disable it"
                )));
            }
        }
        Ok(())
    }
}

/// Settings for the outgoing connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Forces the compression flag of every acquired connection, ignoring the endpoint's own flag
    pub override_compress: Option<bool>,
    /// Give up on the remaining connectors after a connect timeout
    pub stop_on_connect_timeout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            override_compress: None,
            stop_on_connect_timeout: true,
        }
    }
}

impl PoolConfig {
    /// Forces the compression flag of acquired connections. `None` follows the endpoint.
    pub fn with_override_compress(mut self, compress: impl Into<Option<bool>>) -> Self {
        self.override_compress = compress.into();
        self
    }

    /// Whether a connect timeout ends the attempt instead of trying the next connector.
    pub fn with_stop_on_connect_timeout(mut self, stop: bool) -> Self {
        self.stop_on_connect_timeout = stop;
        self
    }
}
