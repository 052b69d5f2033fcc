//! Outgoing connection pool.
//!
//! [`Pool::acquire`] hands out a usable connection for a list of endpoints, sharing established
//! connections between callers. Concurrent calls that need the same connector wait on a single
//! connection attempt rather than dialing it again.

mod pending;
mod retry;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

pub use retry::{classify, ConnectorFallback};

use self::pending::{PendingConnects, WaitOutcome};
use crate::{
    config::PoolConfig,
    connection::{Connection, InvocationError, InvocationMode, Reply},
    context::RuntimeContext,
    dispatch::Adapter,
    endpoint::{Connector, Endpoint},
    error::{Error, Result},
    transport::{Dialer, DnsResolver, Resolver, TcpDialer},
};

/// A connection handed out by [`Pool::acquire`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acquired {
    /// The shared connection
    pub connection: Connection,
    /// Whether requests on this connection should be compressed
    pub compress: bool,
}

impl Acquired {
    /// Sends a two-way request, compressed according to the pool's decision for this connection.
    pub async fn request(&self, body: &[u8]) -> Result<Reply, InvocationError> {
        self.connection
            .invoke(InvocationMode::Twoway, body, self.compress)
            .map_err(|error| InvocationError { error, sent: false })?
            .await
    }
}

/// Shares outgoing connections between callers.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    ctx: RuntimeContext,
    config: PoolConfig,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    state: Mutex<PoolState>,
    /// Live connections plus in-flight `acquire` calls
    outstanding: watch::Sender<usize>,
    default_adapter: ArcSwapOption<Arc<dyn Adapter>>,
}

#[derive(Default)]
struct PoolState {
    destroyed: bool,
    by_connector: HashMap<Connector, Vec<Connection>>,
    by_endpoint: HashMap<Endpoint, Vec<Connection>>,
    pending: PendingConnects,
}

/// A resolved connector together with the endpoint it came from.
#[derive(Clone, Debug)]
struct Candidate {
    connector: Connector,
    endpoint: Endpoint,
}

enum Step {
    Found(Acquired),
    Wait(tokio::sync::oneshot::Receiver<WaitOutcome>),
    Connect,
}

impl Pool {
    /// Creates a pool dialing TCP and resolving through the system resolver.
    pub fn new(ctx: RuntimeContext, config: PoolConfig) -> Self {
        Pool::builder(ctx).with_config(config).build()
    }

    /// Starts building a pool with a custom resolver or dialer.
    pub fn builder(ctx: RuntimeContext) -> PoolBuilder {
        PoolBuilder {
            ctx,
            config: PoolConfig::default(),
            resolver: Arc::new(DnsResolver),
            dialer: Arc::new(TcpDialer),
        }
    }

    /// The runtime context connections are created with.
    pub fn context(&self) -> &RuntimeContext {
        &self.inner.ctx
    }

    /// Returns a usable connection to one of `endpoints`, preferring earlier endpoints.
    ///
    /// An existing connection is reused when one is usable. Otherwise every resolved connector is
    /// tried in order until one connects and validates. `more_alternatives` tells the pool the caller
    /// has other endpoints to fall back on, which only lowers the level failures are logged at.
    pub async fn acquire(&self, endpoints: &[Endpoint], more_alternatives: bool) -> Result<Acquired> {
        let _tracked = self.inner.track();
        if endpoints.is_empty() {
            return Err(Error::NoEndpoint);
        }

        {
            let state = self.inner.state.lock();
            if state.destroyed {
                return Err(Error::CommunicatorDestroyed);
            }
            if let Some(acquired) = self.inner.find_by_endpoint(&state, endpoints) {
                return Ok(acquired);
            }
        }

        let mut candidates = self.inner.resolve(endpoints).await?;
        loop {
            let step = {
                let mut state = self.inner.state.lock();
                if state.destroyed {
                    return Err(Error::CommunicatorDestroyed);
                }
                let connectors: Vec<Connector> =
                    candidates.iter().map(|c| c.connector.clone()).collect();
                if let Some(acquired) = self
                    .inner
                    .find_by_endpoint(&state, endpoints)
                    .or_else(|| self.inner.find_by_connector(&state, &candidates))
                {
                    Step::Found(acquired)
                } else if state.pending.is_pending(&connectors) {
                    trace!(connectors = ?connectors, "waiting on pending connection attempt");
                    Step::Wait(state.pending.attach(connectors))
                } else {
                    state.pending.claim(&connectors);
                    Step::Connect
                }
            };

            match step {
                Step::Found(acquired) => return Ok(acquired),
                Step::Connect => {
                    return self.inner.connect(&candidates, more_alternatives).await;
                }
                Step::Wait(rx) => match rx.await {
                    Ok(WaitOutcome::Connected(connection)) => {
                        let compress = self.inner.compress_for(&candidates, &connection);
                        return Ok(Acquired {
                            connection,
                            compress,
                        });
                    }
                    Ok(WaitOutcome::Failed(error)) => return Err(error),
                    Ok(WaitOutcome::Retry(remaining)) => {
                        candidates.retain(|c| remaining.contains(&c.connector));
                        if candidates.is_empty() {
                            return Err(Error::NoEndpoint);
                        }
                    }
                    Err(_) => {}
                },
            }
        }
    }

    /// Returns every cached connection.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections(&self.inner.state.lock())
    }

    /// Flushes the batch queue of every cached connection.
    pub fn flush_batch_requests(&self) {
        for connection in self.connections() {
            if let Err(err) = connection.flush_batch() {
                trace!(connection = connection.id(), %err, "batch flush failed");
            }
        }
    }

    /// Installs the adapter new outgoing connections dispatch incoming requests to.
    pub fn set_default_adapter(&self, adapter: Option<Arc<dyn Adapter>>) {
        self.inner.default_adapter.store(adapter.map(Arc::new));
    }

    /// The adapter installed on new outgoing connections.
    pub fn default_adapter(&self) -> Option<Arc<dyn Adapter>> {
        self.inner
            .default_adapter
            .load_full()
            .map(|adapter| (*adapter).clone())
    }

    /// Detaches the adapter named `name` from every cached connection.
    pub fn remove_adapter(&self, name: &str) {
        if self
            .default_adapter()
            .is_some_and(|adapter| adapter.name() == name)
        {
            self.inner.default_adapter.store(None);
        }
        for connection in self.connections() {
            if connection
                .adapter()
                .is_some_and(|adapter| adapter.name() == name)
            {
                connection.set_adapter(None);
            }
        }
    }

    /// Rejects further `acquire` calls and closes every cached connection.
    pub fn destroy(&self) {
        let connections = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            self.inner.connections(&state)
        };
        debug!(connections = connections.len(), "destroying connection pool");
        for connection in connections {
            connection.close_with(Error::CommunicatorDestroyed);
        }
    }

    /// Returns true once [`Pool::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Waits until every connection handed out has finished and no `acquire` call is in flight.
    pub async fn wait_until_finished(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        let _ = rx.wait_for(|outstanding| *outstanding == 0).await;
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("outstanding", &*self.inner.outstanding.borrow())
            .finish()
    }
}

/// Builder for a [`Pool`].
pub struct PoolBuilder {
    ctx: RuntimeContext,
    config: PoolConfig,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
}

impl PoolBuilder {
    /// Set the pool configuration
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the resolver turning endpoints into connectors
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set the dialer opening transports
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Builds the pool.
    pub fn build(self) -> Pool {
        let (outstanding, _) = watch::channel(0);
        Pool {
            inner: Arc::new(PoolInner {
                ctx: self.ctx,
                config: self.config,
                resolver: self.resolver,
                dialer: self.dialer,
                state: Mutex::new(PoolState::default()),
                outstanding,
                default_adapter: ArcSwapOption::empty(),
            }),
        }
    }
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .finish()
    }
}

/// Decrements the outstanding count when dropped.
struct Tracked<'a> {
    outstanding: &'a watch::Sender<usize>,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.outstanding.send_modify(|outstanding| *outstanding -= 1);
    }
}

/// Connectors claimed by one `acquire` call.
///
/// Waiters are told to retry if the call is dropped before it reports an outcome.
struct Claim<'a> {
    pool: &'a PoolInner,
    connectors: Vec<Connector>,
    done: bool,
}

impl Claim<'_> {
    fn fail(mut self, error: &Error) {
        self.done = true;
        self.pool
            .state
            .lock()
            .pending
            .complete_failure(&self.connectors, error);
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.pool.state.lock().pending.abandon(&self.connectors);
        }
    }
}

impl PoolInner {
    fn track(&self) -> Tracked<'_> {
        self.outstanding.send_modify(|outstanding| *outstanding += 1);
        Tracked {
            outstanding: &self.outstanding,
        }
    }

    fn compress(&self, endpoint: &Endpoint) -> bool {
        self.config.override_compress.unwrap_or(endpoint.compress)
    }

    fn compress_for(&self, candidates: &[Candidate], connection: &Connection) -> bool {
        candidates
            .iter()
            .find(|candidate| Some(&candidate.connector) == connection.connector())
            .map(|candidate| self.compress(&candidate.endpoint))
            .unwrap_or_else(|| self.compress(connection.endpoint()))
    }

    fn find_by_endpoint(&self, state: &PoolState, endpoints: &[Endpoint]) -> Option<Acquired> {
        endpoints.iter().find_map(|endpoint| {
            let connection = state
                .by_endpoint
                .get(&endpoint.normalized())?
                .iter()
                .find(|connection| connection.state().is_usable())?;
            Some(Acquired {
                connection: connection.clone(),
                compress: self.compress(endpoint),
            })
        })
    }

    fn find_by_connector(&self, state: &PoolState, candidates: &[Candidate]) -> Option<Acquired> {
        candidates.iter().find_map(|candidate| {
            let connection = state
                .by_connector
                .get(&candidate.connector)?
                .iter()
                .find(|connection| connection.state().is_usable())?;
            Some(Acquired {
                connection: connection.clone(),
                compress: self.compress(&candidate.endpoint),
            })
        })
    }

    fn connections(&self, state: &PoolState) -> Vec<Connection> {
        let mut connections: Vec<Connection> = Vec::new();
        for connection in state.by_connector.values().flatten() {
            if !connections.contains(connection) {
                connections.push(connection.clone());
            }
        }
        connections
    }

    /// Resolves every endpoint, keeping endpoint order and then resolver order, without duplicates.
    async fn resolve(&self, endpoints: &[Endpoint]) -> Result<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut last_error = None;
        for endpoint in endpoints {
            match self.resolver.resolve(endpoint).await {
                Ok(connectors) => {
                    for connector in connectors {
                        if candidates.iter().all(|c| c.connector != connector) {
                            candidates.push(Candidate {
                                connector,
                                endpoint: endpoint.clone(),
                            });
                        }
                    }
                }
                Err(err) => {
                    debug!(%endpoint, %err, "endpoint resolution failed");
                    last_error = Some(err);
                }
            }
        }

        if candidates.is_empty() {
            return Err(last_error.unwrap_or(Error::NoEndpoint));
        }
        Ok(candidates)
    }

    /// Tries the claimed candidates in order and reports the outcome to every waiter.
    async fn connect(
        self: &Arc<Self>,
        candidates: &[Candidate],
        more_alternatives: bool,
    ) -> Result<Acquired> {
        let claim = Claim {
            pool: self,
            connectors: candidates.iter().map(|c| c.connector.clone()).collect(),
            done: false,
        };

        let mut last_error = None;
        for (index, candidate) in candidates.iter().enumerate() {
            if self.state.lock().destroyed {
                last_error = Some(Error::CommunicatorDestroyed);
                break;
            }

            match self.try_connect(candidate).await {
                Ok(connection) => return self.finish(claim, candidate, connection),
                Err(err) => {
                    let has_more = more_alternatives || index + 1 < candidates.len();
                    if has_more {
                        debug!(connector = %candidate.connector, %err, "connection attempt failed");
                    } else {
                        warn!(connector = %candidate.connector, %err, "connection attempt failed");
                    }
                    let fallback = classify(&err, &self.config);
                    last_error = Some(err);
                    if fallback == ConnectorFallback::Stop {
                        break;
                    }
                }
            }
        }

        let error = last_error.unwrap_or(Error::NoEndpoint);
        claim.fail(&error);
        Err(error)
    }

    async fn try_connect(&self, candidate: &Candidate) -> Result<Connection> {
        let Candidate {
            connector,
            endpoint,
        } = candidate;
        let timeout = connector
            .timeout
            .or(endpoint.timeout)
            .or(self.ctx.config().connect_timeout);

        trace!(%connector, "connecting");
        let dial = self.dialer.dial(connector);
        let transport = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, dial)
                .await
                .map_err(|_| Error::ConnectTimeout)??,
            None => dial.await?,
        };

        let connection =
            Connection::connect(&self.ctx, endpoint.clone(), Some(connector.clone()), transport)
                .await?;
        if let Some(adapter) = self.default_adapter.load_full() {
            connection.set_adapter(Some((*adapter).clone()));
        }
        Ok(connection)
    }

    /// Caches a new connection and hands it to the waiters that asked for its connector.
    fn finish(
        self: &Arc<Self>,
        mut claim: Claim<'_>,
        candidate: &Candidate,
        connection: Connection,
    ) -> Result<Acquired> {
        let normalized = candidate.endpoint.normalized();
        let endpoint_keys = [
            normalized.clone().with_compress(true),
            normalized.with_compress(false),
        ];

        let destroyed = {
            let mut state = self.state.lock();
            claim.done = true;
            if state.destroyed {
                state
                    .pending
                    .complete_failure(&claim.connectors, &Error::CommunicatorDestroyed);
            } else {
                state
                    .by_connector
                    .entry(candidate.connector.clone())
                    .or_default()
                    .push(connection.clone());
                for key in &endpoint_keys {
                    state
                        .by_endpoint
                        .entry(key.clone())
                        .or_default()
                        .push(connection.clone());
                }
                state
                    .pending
                    .complete_success(&claim.connectors, &candidate.connector, &connection);
            }
            self.outstanding.send_modify(|outstanding| *outstanding += 1);
            state.destroyed
        };

        let outstanding = self.outstanding.clone();
        connection.on_finished(move |_| {
            outstanding.send_modify(|outstanding| *outstanding -= 1);
        });

        if destroyed {
            connection.close_with(Error::CommunicatorDestroyed);
            return Err(Error::CommunicatorDestroyed);
        }

        let pool = Arc::downgrade(self);
        let connector = candidate.connector.clone();
        connection.on_closed(move |connection| {
            remove_connection(&pool, &connector, &endpoint_keys, connection);
        });

        debug!(
            connection = connection.id(),
            connector = %candidate.connector,
            "connection cached"
        );
        Ok(Acquired {
            compress: self.compress(&candidate.endpoint),
            connection,
        })
    }
}

fn remove_connection(
    pool: &Weak<PoolInner>,
    connector: &Connector,
    endpoint_keys: &[Endpoint],
    connection: &Connection,
) {
    let Some(pool) = pool.upgrade() else {
        return;
    };
    let mut state = pool.state.lock();
    remove_from(&mut state.by_connector, connector, connection);
    for key in endpoint_keys {
        remove_from(&mut state.by_endpoint, key, connection);
    }
    trace!(connection = connection.id(), %connector, "connection removed from pool");
}

fn remove_from<K>(map: &mut HashMap<K, Vec<Connection>>, key: &K, connection: &Connection)
where
    K: std::hash::Hash + Eq,
{
    if let Some(connections) = map.get_mut(key) {
        connections.retain(|c| c != connection);
        if connections.is_empty() {
            map.remove(key);
        }
    }
}
