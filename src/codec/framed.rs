//! Framed transport: every message is a 4-byte big-endian length followed by
//! that many payload bytes

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

use super::{BoxIo, Pipeline};
use crate::error::{Error, Result};
use crate::service::{BoxService, Service};
use crate::transport::Endpoint;

/// Largest frame accepted in either direction
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Pipeline producing [`FramedConnection`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedPipeline;

#[async_trait]
impl Pipeline for FramedPipeline {
    fn name(&self) -> &'static str {
        "thrift"
    }

    async fn bind(&self, io: BoxIo, endpoint: &Endpoint) -> Result<BoxService> {
        Ok(Box::new(FramedConnection::new(io, endpoint.clone())))
    }
}

/// One framed request/reply connection
pub struct FramedConnection {
    endpoint: Endpoint,
    io: Mutex<BoxIo>,
    // Set while a request is on the wire. A dispatch that did not finish
    // leaves the stream mid-frame, so it stays set.
    broken: AtomicBool,
}

impl FramedConnection {
    pub fn new(io: BoxIo, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            io: Mutex::new(io),
            broken: AtomicBool::new(false),
        }
    }

    async fn exchange(io: &mut BoxIo, request: &[u8]) -> Result<Bytes> {
        let len = u32::try_from(request.len())
            .map_err(|_| Error::Dispatch("Request frame too large".to_string()))?;
        io.write_all(&len.to_be_bytes()).await?;
        io.write_all(request).await?;
        io.flush().await?;

        let mut header = [0u8; 4];
        io.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Dispatch(format!(
                "Reply frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }

        let mut reply = vec![0u8; len];
        io.read_exact(&mut reply).await?;
        Ok(Bytes::from(reply))
    }
}

#[async_trait]
impl Service for FramedConnection {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        if request.len() > MAX_FRAME_LEN {
            return Err(Error::Dispatch(format!(
                "Request frame of {} bytes exceeds the {} byte limit",
                request.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut io = self
            .io
            .try_lock()
            .map_err(|_| Error::Dispatch("Connection is busy".to_string()))?;
        if self.broken.load(Ordering::Acquire) {
            return Err(Error::Dispatch(format!(
                "Connection to {} is broken",
                self.endpoint
            )));
        }

        self.broken.store(true, Ordering::Release);
        let reply = Self::exchange(&mut io, &request).await?;
        self.broken.store(false, Ordering::Release);

        trace!(endpoint = %self.endpoint, request = request.len(), reply = reply.len(), "Frame exchanged");
        Ok(reply)
    }

    fn is_available(&self) -> bool {
        if self.broken.load(Ordering::Acquire) {
            return false;
        }
        let Ok(mut io) = self.io.try_lock() else {
            return false;
        };

        // An idle connection has nothing to read. EOF means the peer hung up
        // and stray bytes mean the stream is out of step; both retire it.
        let mut byte = [0u8; 1];
        let polled = io.read(&mut byte).now_or_never();
        match polled {
            None => true,
            Some(result) => {
                trace!(endpoint = %self.endpoint, ?result, "Idle framed connection is readable");
                self.broken.store(true, Ordering::Release);
                false
            }
        }
    }

    fn release(self: Box<Self>) {
        trace!(endpoint = %self.endpoint, "Closing framed connection");
    }
}
