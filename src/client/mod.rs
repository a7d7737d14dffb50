//! The assembled client: one logical dispatcher over every configured host
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use rpcpool::{ClientBuilder, Codec, Timeout};
//!
//! # async fn example() -> rpcpool::Result<()> {
//! let client = ClientBuilder::new()
//!     .with_hosts("rpc-1.internal:9090,rpc-2.internal:9090")
//!     .with_codec(Codec::Thrift)
//!     .with_connect_timeout(Timeout::seconds(1))
//!     .with_request_timeout(Timeout::millis(250))
//!     .with_name("search")
//!     .build()?;
//!
//! let reply = client.dispatch(b"ping".to_vec()).await?;
//! println!("{} bytes", reply.len());
//!
//! for host in client.host_stats() {
//!     println!("{}: health={} in_flight={}", host.endpoint, host.health_score, host.in_flight);
//! }
//!
//! client.close();
//! # Ok(())
//! # }
//! ```

pub mod builder;

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::error::{Error, Result};
use crate::lb::{LoadBalancer, Strategy};
use crate::service::Dispatcher;
use crate::stats::HostSnapshot;
use crate::transport::{Endpoint, SharedTransport};

pub use builder::ClientBuilder;

/// Client handle returned by [`ClientBuilder::build`]
pub struct Client {
    balancer: LoadBalancer,
    transport: SharedTransport,
    owns_transport: bool,
    name: Option<String>,
    closed: AtomicBool,
}

impl Client {
    fn new(
        balancer: LoadBalancer,
        transport: SharedTransport,
        owns_transport: bool,
        name: Option<String>,
    ) -> Self {
        Self {
            balancer,
            transport,
            owns_transport,
            name,
            closed: AtomicBool::new(false),
        }
    }

    /// Send one request to a selected host and wait for its reply
    pub async fn dispatch(&self, request: impl Into<Bytes>) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::FactoryClosed);
        }
        self.balancer.dispatch(request.into()).await
    }

    pub fn is_available(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.balancer.is_available()
    }

    /// Close every host and release idle connections. Dispatches already in
    /// flight complete normally. A transport created by `build()` is shut
    /// down; a shared one is left alone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.balancer.close();
        if self.owns_transport {
            self.transport.shutdown();
        }
        info!(
            name = self.name.as_deref().unwrap_or("-"),
            hosts = self.balancer.host_count(),
            "Client closed"
        );
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn strategy(&self) -> Strategy {
        self.balancer.strategy()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.balancer
            .hosts()
            .iter()
            .map(|host| host.stats.endpoint.clone())
            .collect()
    }

    /// Per-host in-flight count, health and windowed request stats
    pub fn host_stats(&self) -> Vec<HostSnapshot> {
        self.balancer.snapshots()
    }
}
