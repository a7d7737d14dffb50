//! Wire protocols
//!
//! A [`Codec`] selects a [`Pipeline`]: the function that turns a freshly
//! connected byte stream into a live [`Service`](crate::service::Service)
//! speaking that protocol. Pipelines are stateless and shared by every
//! connection a client opens.

pub mod framed;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::service::BoxService;
use crate::transport::Endpoint;

pub use framed::{FramedPipeline, MAX_FRAME_LEN};
pub use http::HttpPipeline;

/// A bidirectional byte stream a pipeline can run on
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type BoxIo = Box<dyn Io>;

/// Builds a protocol connection on top of a raw stream
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn bind(&self, io: BoxIo, endpoint: &Endpoint) -> Result<BoxService>;
}

pub type SharedPipeline = Arc<dyn Pipeline>;

/// Supported wire protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// HTTP/1.1 request/reply
    Http,
    /// Length-prefixed frames as used by framed Thrift transports
    Thrift,
}

impl Codec {
    pub fn pipeline(self) -> SharedPipeline {
        match self {
            Codec::Http => Arc::new(HttpPipeline),
            Codec::Thrift => Arc::new(FramedPipeline),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Http => write!(f, "http"),
            Codec::Thrift => write!(f, "thrift"),
        }
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Codec::Http),
            "thrift" => Ok(Codec::Thrift),
            other => Err(Error::config(format!("Unknown codec '{}'", other))),
        }
    }
}
