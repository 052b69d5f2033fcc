#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod compress;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod transport;

pub use config::{ConnectionConfig, PoolConfig};
pub use connection::{
    CloseMode, Connection, Invocation, InvocationError, InvocationMode, Reply, SendStatus, State,
};
pub use context::RuntimeContext;
pub use dispatch::{adapter_fn, Adapter, DispatchError, IncomingRequest};
pub use endpoint::{Connector, Endpoint, Protocol};
pub use error::{Error, ErrorKind, Result};
pub use pool::{Acquired, Pool};
