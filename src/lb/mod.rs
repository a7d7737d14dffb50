//! Load balancing across hosts
//!
//! # Strategies
//!
//! - **Round-robin**: Simple sequential distribution (default)
//! - **Least-loaded**: Always pick the host with the fewest dispatches in flight
//! - **Power-of-two**: Pick 2 random hosts, choose the one with fewer in flight
//!
//! # Health
//!
//! Every host carries a passive health score from 0-100 maintained by its
//! stats layer, with hosts considered healthy if score > 30. Unhealthy and
//! closed hosts are skipped; if no host is healthy the least unhealthy
//! available one is used.

pub mod balancer;

pub use balancer::{HostHandle, LoadBalancer, Strategy};
