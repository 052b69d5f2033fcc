#![allow(dead_code)]

use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use tether::{
    context::ConnectionObserver,
    protocol::{encode_control, encode_request, Header, MessageType, HEADER_SIZE},
    transport::{BoxTransport, Dialer, Resolver},
    Adapter, Connection, ConnectionConfig, Connector, Endpoint, Protocol, Result, RuntimeContext,
    State,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing_subscriber::EnvFilter;

pub const BUFFER: usize = 64 * 1024;

/// Logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .with_target(false)
        .with_test_writer()
        .try_init();
}

pub fn endpoint() -> Endpoint {
    Endpoint::tcp("127.0.0.1", 4061)
}

pub fn context(config: ConnectionConfig) -> RuntimeContext {
    init_tracing();
    RuntimeContext::builder().with_config(config).build().unwrap()
}

/// A validated client and active server connected through an in-memory duplex.
pub async fn pair(
    client_ctx: &RuntimeContext,
    server_ctx: &RuntimeContext,
    adapter: Option<Arc<dyn Adapter>>,
) -> (Connection, Connection) {
    init_tracing();
    let (client_io, server_io) = duplex(BUFFER);
    let (client, server) = tokio::join!(
        Connection::connect(client_ctx, endpoint(), None, Box::new(client_io)),
        Connection::accept(server_ctx, endpoint(), Box::new(server_io), adapter),
    );
    let server = server.unwrap();
    server.activate();
    (client.unwrap(), server)
}

/// Records every state transition reported by the runtime.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub transitions: Mutex<Vec<(u64, State, State)>>,
}

impl RecordingObserver {
    pub fn states_of(&self, connection_id: u64) -> Vec<State> {
        self.transitions
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == connection_id)
            .map(|(_, _, new)| *new)
            .collect()
    }
}

impl ConnectionObserver for RecordingObserver {
    fn state_changed(&self, connection_id: u64, old: State, new: State) {
        self.transitions.lock().push((connection_id, old, new));
    }
}

/// The far side of a connection driven by hand, speaking raw frames.
pub struct RawPeer {
    pub io: DuplexStream,
    buf: BytesMut,
}

impl RawPeer {
    pub fn new(io: DuplexStream) -> Self {
        RawPeer {
            io,
            buf: BytesMut::new(),
        }
    }

    /// Accepts `client` as a server would, by sending the validate frame.
    pub async fn serve(client_ctx: &RuntimeContext, buffer: usize) -> (Connection, RawPeer) {
        init_tracing();
        let (client_io, server_io) = duplex(buffer);
        let mut peer = RawPeer::new(server_io);
        peer.send(&encode_control(MessageType::ValidateConnection))
            .await;
        let client = Connection::connect(client_ctx, endpoint(), None, Box::new(client_io))
            .await
            .unwrap();
        (client, peer)
    }

    /// Connects to `server` as a client would, consuming its validate frame.
    pub async fn connect(
        server_ctx: &RuntimeContext,
        adapter: Option<Arc<dyn Adapter>>,
    ) -> (Connection, RawPeer) {
        init_tracing();
        let (client_io, server_io) = duplex(BUFFER);
        let server = Connection::accept(server_ctx, endpoint(), Box::new(server_io), adapter)
            .await
            .unwrap();
        let mut peer = RawPeer::new(client_io);
        let (header, _) = peer.read_frame().await.unwrap();
        assert_eq!(header.message_type, MessageType::ValidateConnection);
        (server, peer)
    }

    pub async fn send(&mut self, frame: &[u8]) {
        self.io.write_all(frame).await.unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn send_request(&mut self, request_id: i32, body: &[u8]) {
        self.send(&encode_request(request_id, body)).await;
    }

    /// Reads the next complete frame, or `None` on end of stream.
    pub async fn read_frame(&mut self) -> Option<(Header, Bytes)> {
        loop {
            if self.buf.len() >= HEADER_SIZE {
                let header = Header::decode(&self.buf[..HEADER_SIZE]).unwrap();
                if self.buf.len() >= header.size as usize {
                    let mut frame = self.buf.split_to(header.size as usize);
                    frame.advance(HEADER_SIZE);
                    return Some((header, frame.freeze()));
                }
            }
            if self.io.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    /// Reads the next frame, failing if none arrives within `timeout`.
    pub async fn expect_frame(&mut self, timeout: Duration) -> (Header, Bytes) {
        tokio::time::timeout(timeout, self.read_frame())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
    }

    /// Returns true if no frame arrives within `timeout`.
    pub async fn is_silent(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.read_frame())
            .await
            .is_err()
    }
}

/// Resolves every endpoint to a fixed list of connectors.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    pub connectors: Vec<Connector>,
}

impl StaticResolver {
    pub fn ports(ports: &[u16]) -> Arc<Self> {
        Arc::new(StaticResolver {
            connectors: ports
                .iter()
                .map(|port| Connector::new(Protocol::Tcp, ([127, 0, 0, 1], *port).into()))
                .collect(),
        })
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, _endpoint: &Endpoint) -> BoxFuture<'static, Result<Vec<Connector>>> {
        futures::future::ready(Ok(self.connectors.clone())).boxed()
    }
}

/// What a [`MockDialer`] does with a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialBehavior {
    /// Connect to an in-memory server that accepts and activates the connection.
    Serve,
    /// Fail with connection refused.
    Refuse,
    /// Never complete.
    Hang,
}

/// Dials in-memory servers, counting attempts per connector.
pub struct MockDialer {
    pub server_ctx: RuntimeContext,
    pub adapter: Option<Arc<dyn Adapter>>,
    pub delay: Duration,
    pub behavior: Mutex<Vec<(u16, DialBehavior)>>,
    pub dials: AtomicUsize,
    pub dialed: Mutex<Vec<u16>>,
}

impl MockDialer {
    pub fn new(adapter: Option<Arc<dyn Adapter>>) -> Arc<Self> {
        Arc::new(MockDialer {
            server_ctx: RuntimeContext::default(),
            adapter,
            delay: Duration::from_millis(20),
            behavior: Mutex::new(Vec::new()),
            dials: AtomicUsize::new(0),
            dialed: Mutex::new(Vec::new()),
        })
    }

    pub fn with_behavior(adapter: Option<Arc<dyn Adapter>>, behavior: &[(u16, DialBehavior)]) -> Arc<Self> {
        let dialer = MockDialer::new(adapter);
        *dialer.behavior.lock() = behavior.to_vec();
        dialer
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, port: u16) -> DialBehavior {
        self.behavior
            .lock()
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, behavior)| *behavior)
            .unwrap_or(DialBehavior::Serve)
    }
}

impl std::fmt::Debug for MockDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDialer")
            .field("dials", &self.dial_count())
            .finish()
    }
}

impl Dialer for MockDialer {
    fn dial(&self, connector: &Connector) -> BoxFuture<'static, io::Result<BoxTransport>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let port = connector.addr.port();
        self.dialed.lock().push(port);
        let behavior = self.behavior_for(port);
        let delay = self.delay;
        let server_ctx = self.server_ctx.clone();
        let adapter = self.adapter.clone();
        async move {
            tokio::time::sleep(delay).await;
            match behavior {
                DialBehavior::Serve => {
                    let (client_io, server_io) = duplex(BUFFER);
                    tokio::spawn(async move {
                        if let Ok(server) =
                            Connection::accept(&server_ctx, endpoint(), Box::new(server_io), adapter)
                                .await
                        {
                            server.activate();
                        }
                    });
                    Ok(Box::new(client_io) as BoxTransport)
                }
                DialBehavior::Refuse => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
                DialBehavior::Hang => futures::future::pending().await,
            }
        }
        .boxed()
    }
}
