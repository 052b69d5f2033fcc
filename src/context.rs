//! Runtime wide settings shared by every connection.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    compress::{default_compressor, Compressor},
    config::ConnectionConfig,
    connection::State,
    error::Result,
};

/// Observes connection state transitions.
///
/// Notifications are delivered in transition order, after the connection lock is released.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// The connection `connection_id` moved from `old` to `new`.
    fn state_changed(&self, connection_id: u64, old: State, new: State);
}

/// Settings, collaborators and counters shared by the connections of one runtime.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct RuntimeContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: ConnectionConfig,
    compressor: Option<Arc<dyn Compressor>>,
    trace_protocol: bool,
    observer: Option<Arc<dyn ConnectionObserver>>,
    next_connection_id: AtomicU64,
}

impl RuntimeContext {
    /// Starts building a context with default settings.
    pub fn builder() -> RuntimeContextBuilder {
        RuntimeContextBuilder::default()
    }

    /// Settings applied to every connection of this context.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// The compressor, `None` when compression is disabled.
    pub fn compressor(&self) -> Option<&dyn Compressor> {
        self.inner.compressor.as_deref()
    }

    /// Log every frame sent and received at trace level.
    pub fn trace_protocol(&self) -> bool {
        self.inner.trace_protocol
    }

    pub(crate) fn observer(&self) -> Option<&dyn ConnectionObserver> {
        self.inner.observer.as_deref()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        RuntimeContextBuilder::default().build_unchecked()
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config", &self.inner.config)
            .field("compressor", &self.inner.compressor)
            .field("trace_protocol", &self.inner.trace_protocol)
            .field("observer", &self.inner.observer.is_some())
            .finish()
    }
}

/// Builder for a [`RuntimeContext`].
pub struct RuntimeContextBuilder {
    config: ConnectionConfig,
    compressor: Option<Arc<dyn Compressor>>,
    trace_protocol: bool,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

impl Default for RuntimeContextBuilder {
    fn default() -> Self {
        RuntimeContextBuilder {
            config: ConnectionConfig::default(),
            compressor: default_compressor(),
            trace_protocol: false,
            observer: None,
        }
    }
}

impl fmt::Debug for RuntimeContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContextBuilder")
            .field("config", &self.config)
            .field("compressor", &self.compressor)
            .field("trace_protocol", &self.trace_protocol)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RuntimeContextBuilder {
    /// Set the connection configuration
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the compressor, or disable compression with `None`
    pub fn with_compressor(mut self, compressor: Option<Arc<dyn Compressor>>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Log every frame at trace level
    pub fn with_trace_protocol(mut self, enabled: bool) -> Self {
        self.trace_protocol = enabled;
        self
    }

    /// Observe connection state transitions
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Validate the configuration and build the context
    pub fn build(self) -> Result<RuntimeContext> {
        self.config.validate()?;
        Ok(self.build_unchecked())
    }

    fn build_unchecked(self) -> RuntimeContext {
        RuntimeContext {
            inner: Arc::new(ContextInner {
                config: self.config,
                compressor: self.compressor,
                trace_protocol: self.trace_protocol,
                observer: self.observer,
                next_connection_id: AtomicU64::new(0),
            }),
        }
    }
}
