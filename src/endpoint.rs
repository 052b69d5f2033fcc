//! Endpoints name where a server listens; connectors are the resolved addresses a pool dials.

use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Transport protocol of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream transport with the validate and close handshakes
    Tcp,
    /// Datagram transport
    Udp,
}

impl Protocol {
    /// Datagram transports skip validation and close without the close handshake.
    pub fn is_datagram(self) -> bool {
        matches!(self, Protocol::Udp)
    }

    /// Name used in the endpoint string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unresolved address a server can be reached at.
///
/// Written as `tcp -h <host> -p <port> [-t <millis>] [-z]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Transport protocol
    pub protocol: Protocol,
    /// Host name or IP address, resolved by the pool's resolver
    pub host: String,
    /// Port the server listens on
    pub port: u16,
    /// Connect timeout for this endpoint, overriding the configured default
    pub timeout: Option<Duration>,
    /// Request compression on connections to this endpoint
    pub compress: bool,
}

impl Endpoint {
    /// A TCP endpoint without timeout or compression.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            protocol: Protocol::Tcp,
            host: host.into(),
            port,
            timeout: None,
            compress: false,
        }
    }

    /// A UDP endpoint without timeout or compression.
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            protocol: Protocol::Udp,
            ..Endpoint::tcp(host, port)
        }
    }

    /// Sets the connect timeout for this endpoint.
    pub fn with_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Sets whether requests on this endpoint should be compressed.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Returns the endpoint with its timeout removed, used as the pool's cache key.
    pub fn normalized(&self) -> Endpoint {
        Endpoint {
            timeout: None,
            ..self.clone()
        }
    }

    /// Returns true for datagram endpoints.
    pub fn is_datagram(&self) -> bool {
        self.protocol.is_datagram()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -h {} -p {}", self.protocol, self.host, self.port)?;
        if let Some(timeout) = self.timeout {
            write!(f, " -t {}", timeout.as_millis())?;
        }
        if self.compress {
            f.write_str(" -z")?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parse_err = |reason: String| Error::EndpointParse {
            input: input.to_string(),
            reason,
        };

        let mut parts = input.split_whitespace();
        let protocol = match parts.next() {
            Some("tcp") => Protocol::Tcp,
            Some("udp") => Protocol::Udp,
            Some(other) => return Err(parse_err(format!("unknown protocol `{other}`"))),
            None => return Err(parse_err("empty endpoint".into())),
        };

        let mut host = None;
        let mut port = None;
        let mut timeout = None;
        let mut compress = false;
        while let Some(flag) = parts.next() {
            let mut value = |name: &str| {
                parts
                    .next()
                    .ok_or_else(|| parse_err(format!("missing value for {name}")))
            };
            match flag {
                "-h" => host = Some(value("-h")?.to_string()),
                "-p" => {
                    let raw = value("-p")?;
                    port = Some(
                        raw.parse::<u16>()
                            .map_err(|err| parse_err(format!("invalid port `{raw}`: {err}")))?,
                    );
                }
                "-t" => {
                    let raw = value("-t")?;
                    let millis = raw
                        .parse::<u64>()
                        .map_err(|err| parse_err(format!("invalid timeout `{raw}`: {err}")))?;
                    timeout = Some(Duration::from_millis(millis));
                }
                "-z" => compress = true,
                other => return Err(parse_err(format!("unknown option `{other}`"))),
            }
        }

        Ok(Endpoint {
            protocol,
            host: host.ok_or_else(|| parse_err("missing -h".into()))?,
            port: port.ok_or_else(|| parse_err("missing -p".into()))?,
            timeout,
            compress,
        })
    }
}

/// A resolved socket address for one endpoint.
///
/// Connectors are the unit the pool de-duplicates connection attempts on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Connector {
    /// Transport protocol, taken from the endpoint
    pub protocol: Protocol,
    /// Resolved address
    pub addr: SocketAddr,
    /// Connect timeout inherited from the endpoint
    pub timeout: Option<Duration>,
}

impl Connector {
    /// A connector without a timeout.
    pub fn new(protocol: Protocol, addr: SocketAddr) -> Self {
        Connector {
            protocol,
            addr,
            timeout: None,
        }
    }

    /// Sets the connect timeout.
    pub fn with_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.addr)
    }
}
