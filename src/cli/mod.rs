//! Command-line front end
//!
//! # Usage
//!
//! ```bash
//! # Send one request through a two-host client
//! rpcpool send --hosts rpc-1:9090,rpc-2:9090 --codec thrift ping
//!
//! # 1000 requests, 16 in flight, then a per-host summary
//! rpcpool probe --config client.yaml --requests 1000 --concurrency 16
//! ```

pub mod commands;

pub use commands::{cmd_probe, cmd_send, run_probe, ProbeReport};
