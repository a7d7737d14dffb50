//! HTTP/1.1 request/reply over hyper
//!
//! Each request is sent as the body of a `POST /` with a `Host` header naming
//! the endpoint. 2xx replies yield their body; anything else fails with
//! [`Error::Status`].

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{BoxIo, Pipeline};
use crate::error::{Error, Result};
use crate::service::{BoxService, Service};
use crate::transport::Endpoint;

/// Pipeline producing [`HttpConnection`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpPipeline;

#[async_trait]
impl Pipeline for HttpPipeline {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn bind(&self, io: BoxIo, endpoint: &Endpoint) -> Result<BoxService> {
        let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;

        // Spawn connection driver task
        let driver_endpoint = endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(endpoint = %driver_endpoint, error = %e, "HTTP connection error");
            }
        });

        Ok(Box::new(HttpConnection {
            authority: endpoint.to_string(),
            sender: Mutex::new(sender),
            broken: AtomicBool::new(false),
        }))
    }
}

/// One HTTP/1.1 keep-alive connection
pub struct HttpConnection {
    authority: String,
    sender: Mutex<http1::SendRequest<Full<Bytes>>>,
    broken: AtomicBool,
}

#[async_trait]
impl Service for HttpConnection {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        let mut sender = self
            .sender
            .try_lock()
            .map_err(|_| Error::Dispatch("Connection is busy".to_string()))?;
        if self.broken.load(Ordering::Acquire) {
            return Err(Error::Dispatch(format!(
                "Connection to {} is broken",
                self.authority
            )));
        }

        let request = Request::post("/")
            .header(HOST, self.authority.as_str())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(request))?;

        self.broken.store(true, Ordering::Release);
        sender.ready().await?;
        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        self.broken.store(false, Ordering::Release);

        trace!(authority = %self.authority, status = %status, reply = body.len(), "HTTP exchange");
        if !status.is_success() {
            return Err(Error::Status(status.as_u16()));
        }
        Ok(body)
    }

    fn is_available(&self) -> bool {
        !self.broken.load(Ordering::Acquire)
            && self
                .sender
                .try_lock()
                .map(|sender| !sender.is_closed())
                .unwrap_or(false)
    }

    fn release(self: Box<Self>) {
        trace!(authority = %self.authority, "Closing HTTP connection");
    }
}
