//! rpcpool - connection caching, request timeouts, per-host stats and load
//! balancing for request/reply RPC clients

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod lb;
pub mod pool;
pub mod service;
pub mod stats;
pub mod timeout;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use codec::Codec;
pub use config::ClientConfig;
pub use error::{Error, ErrorKind, Result};
pub use filter::TimeoutAction;
pub use lb::Strategy;
pub use stats::{HostSnapshot, MemoryReceiver, StatsReceiver};
pub use timeout::{TimeUnit, Timeout};
pub use transport::{Endpoint, TcpConfig, TcpTransport, Transport};
