//! TCP transport shared by every connection factory of a client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{Endpoint, Transport};
use crate::codec::Pipeline;
use crate::error::{Error, Result};
use crate::service::BoxService;

/// Socket options applied to every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// Idle time before TCP keep-alive probes start; `None` disables them
    #[serde(default = "default_keepalive", with = "keepalive_secs")]
    pub keepalive: Option<Duration>,
}

fn default_nodelay() -> bool {
    true
}

fn default_keepalive() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: default_nodelay(),
            keepalive: default_keepalive(),
        }
    }
}

/// Keep-alive written as whole seconds in config files
mod keepalive_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Opens plain TCP connections
///
/// Owned explicitly: whoever creates it shuts it down. After
/// [`shutdown`](Transport::shutdown) every connect attempt fails.
#[derive(Debug, Default)]
pub struct TcpTransport {
    config: TcpConfig,
    shut_down: AtomicBool,
    opened: AtomicU64,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            shut_down: AtomicBool::new(false),
            opened: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Connections opened over the transport's lifetime
    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    fn configure(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.config.nodelay)?;
        if let Some(idle) = self.config.keepalive {
            SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint, pipeline: &dyn Pipeline) -> Result<BoxService> {
        if self.is_shut_down() {
            return Err(Error::Connect {
                endpoint: endpoint.clone(),
                reason: "transport is shut down".to_string(),
            });
        }

        let connect_failed = |reason: String| Error::Connect {
            endpoint: endpoint.clone(),
            reason,
        };

        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| connect_failed(e.to_string()))?;
        self.configure(&stream)
            .map_err(|e| connect_failed(e.to_string()))?;

        let service = pipeline
            .bind(Box::new(stream), endpoint)
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        let opened = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            endpoint = %endpoint,
            protocol = pipeline.name(),
            total_opened = opened,
            "Opened connection"
        );
        Ok(service)
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            info!(total_opened = self.connections_opened(), "TCP transport shut down");
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
