//! Raw connections: endpoints, transports and the per-endpoint factory
//!
//! A [`Transport`] opens a byte stream to an endpoint and hands it to a codec
//! [`Pipeline`]. It is shared by all the per-endpoint [`ConnectionFactory`]s
//! of a client and is passed in explicitly, so tests can substitute their own.

pub mod endpoint;
pub mod tcp;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec::{Pipeline, SharedPipeline};
use crate::error::{Error, Result};
use crate::service::{BoxService, ServiceFactory};

pub use endpoint::Endpoint;
pub use tcp::{TcpConfig, TcpTransport};

/// Opens raw connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to `endpoint` and bind the stream with `pipeline`
    async fn connect(&self, endpoint: &Endpoint, pipeline: &dyn Pipeline) -> Result<BoxService>;

    /// Refuse further connects. Connections already open are unaffected.
    fn shutdown(&self);

    fn is_shut_down(&self) -> bool;
}

pub type SharedTransport = Arc<dyn Transport>;

/// [`ServiceFactory`] producing raw connections to one endpoint
pub struct ConnectionFactory {
    endpoint: Endpoint,
    pipeline: SharedPipeline,
    transport: SharedTransport,
    connect_timeout: Option<Duration>,
    open: AtomicBool,
}

impl ConnectionFactory {
    pub fn new(
        endpoint: Endpoint,
        pipeline: SharedPipeline,
        transport: SharedTransport,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            endpoint,
            pipeline,
            transport,
            connect_timeout,
            open: AtomicBool::new(true),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl ServiceFactory for ConnectionFactory {
    async fn make(&self) -> Result<BoxService> {
        if !self.is_available() {
            return Err(Error::FactoryClosed);
        }

        let connect = self.transport.connect(&self.endpoint, self.pipeline.as_ref());
        let result = match self.connect_timeout {
            Some(after) => tokio::time::timeout(after, connect)
                .await
                .unwrap_or_else(|_| {
                    Err(Error::ConnectTimeout {
                        endpoint: self.endpoint.clone(),
                        after,
                    })
                }),
            None => connect.await,
        };

        match result {
            Ok(service) => {
                debug!(endpoint = %self.endpoint, "Connection established");
                Ok(service)
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Connection failed");
                Err(e)
            }
        }
    }

    fn is_available(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.transport.is_shut_down()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(endpoint = %self.endpoint, "Connection factory closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FramedPipeline;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct Loopback;

    #[async_trait]
    impl crate::service::Service for Loopback {
        async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
            Ok(request)
        }

        fn is_available(&self) -> bool {
            true
        }

        fn release(self: Box<Self>) {}
    }

    /// Connects after `delay`
    struct SlowTransport {
        delay: Duration,
        connects: AtomicUsize,
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn connect(&self, _endpoint: &Endpoint, _pipeline: &dyn Pipeline) -> Result<BoxService> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Box::new(Loopback))
        }

        fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }

        fn is_shut_down(&self) -> bool {
            self.shut_down.load(Ordering::SeqCst)
        }
    }

    fn factory(delay: Duration, connect_timeout: Option<Duration>) -> (ConnectionFactory, Arc<SlowTransport>) {
        let transport = Arc::new(SlowTransport {
            delay,
            connects: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        });
        let factory = ConnectionFactory::new(
            Endpoint::new("db-1", 5432),
            Arc::new(FramedPipeline),
            transport.clone(),
            connect_timeout,
        );
        (factory, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_make_connects() {
        let (factory, transport) = factory(Duration::from_millis(10), Some(Duration::from_secs(1)));
        let service = factory.make().await.unwrap();
        assert_eq!(service.dispatch(Bytes::from_static(b"x")).await.unwrap(), "x");
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (factory, _) = factory(Duration::from_secs(60), Some(Duration::from_millis(250)));
        let err = factory.make().await.err().unwrap();
        match err {
            Error::ConnectTimeout { endpoint, after } => {
                assert_eq!(endpoint, Endpoint::new("db-1", 5432));
                assert_eq!(after, Duration::from_millis(250));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_closed_factory_fails() {
        let (factory, transport) = factory(Duration::ZERO, None);
        factory.close();
        factory.close();
        assert!(!factory.is_available());
        assert!(matches!(factory.make().await, Err(Error::FactoryClosed)));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shut_down_transport_makes_factory_unavailable() {
        let (factory, transport) = factory(Duration::ZERO, None);
        transport.shutdown();
        assert!(!factory.is_available());
    }
}
