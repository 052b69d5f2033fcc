use crate::{
    config::PoolConfig,
    error::{Error, ErrorKind},
};

/// Whether a pool keeps trying the remaining connectors after one failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectorFallback {
    /// Give up and report the failure.
    Stop,
    /// Move on to the next connector.
    Continue,
}

/// Classifies a connector failure.
///
/// | failure | fallback |
/// |---|---|
/// | `CommunicatorDestroyed` | stop |
/// | `ConnectTimeout` | stop, unless `stop_on_connect_timeout` is off |
/// | anything else | continue |
pub fn classify(error: &Error, config: &PoolConfig) -> ConnectorFallback {
    match error.kind() {
        ErrorKind::CommunicatorDestroyed => ConnectorFallback::Stop,
        ErrorKind::ConnectTimeout if config.stop_on_connect_timeout => ConnectorFallback::Stop,
        _ => ConnectorFallback::Continue,
    }
}
