//! Collaborators that give connections their bytes: transports, dialers and resolvers.

use std::io;

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::{debug, trace};

use crate::{
    endpoint::{Connector, Endpoint, Protocol},
    error::{Error, Result},
};

/// A connected duplex byte stream.
///
/// Implemented for anything readable and writable, such as [`TcpStream`] or
/// [`tokio::io::DuplexStream`].
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A type erased transport.
pub type BoxTransport = Box<dyn Transport>;

/// Opens transports to resolved connectors.
pub trait Dialer: Send + Sync + 'static {
    /// Connects to `connector`.
    ///
    /// The returned future is raced against the connect timeout, so it does not need its own.
    fn dial(&self, connector: &Connector) -> BoxFuture<'static, io::Result<BoxTransport>>;
}

/// Turns endpoints into connectors.
pub trait Resolver: Send + Sync + 'static {
    /// Resolves `endpoint` into one connector per address, in preference order.
    fn resolve(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Vec<Connector>>>;
}

/// Dials TCP connectors with Tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, connector: &Connector) -> BoxFuture<'static, io::Result<BoxTransport>> {
        let connector = connector.clone();
        async move {
            if connector.protocol != Protocol::Tcp {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("cannot dial {} connectors", connector.protocol),
                ));
            }

            trace!(%connector, "dialing");
            let stream = TcpStream::connect(connector.addr).await?;
            stream.set_nodelay(true)?;
            debug!(%connector, "dialed");
            Ok(Box::new(stream) as BoxTransport)
        }
        .boxed()
    }
}

/// Resolves endpoints with the system resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Vec<Connector>>> {
        let endpoint = endpoint.clone();
        async move {
            let addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
                .await
                .map_err(|err| Error::DnsFailed {
                    host: endpoint.host.clone(),
                    reason: err.to_string(),
                })?;

            let mut connectors: Vec<Connector> = Vec::new();
            for addr in addrs {
                let connector = Connector::new(endpoint.protocol, addr).with_timeout(endpoint.timeout);
                if !connectors.contains(&connector) {
                    connectors.push(connector);
                }
            }
            if connectors.is_empty() {
                return Err(Error::DnsFailed {
                    host: endpoint.host,
                    reason: "no addresses".into(),
                });
            }
            trace!(%endpoint, count = connectors.len(), "resolved");
            Ok(connectors)
        }
        .boxed()
    }
}
