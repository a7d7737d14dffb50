use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::client::ClientBuilder;
use crate::codec::Codec;
use crate::filter::TimeoutAction;
use crate::lb::Strategy;
use crate::pool::DEFAULT_CACHE_SIZE;
use crate::stats::{DEFAULT_GRANULARITY, DEFAULT_WINDOW};
use crate::timeout::Timeout;
use crate::transport::{Endpoint, TcpConfig};

/// Client configuration as read from a file or the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote endpoints, `host:port`
    #[serde(default)]
    pub hosts: Vec<Endpoint>,

    /// Wire protocol: http or thrift
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<Codec>,

    /// Prefix for published per-host stats
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Timeout>,

    /// Unbounded if absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Timeout>,

    /// What happens to a dispatch that times out
    #[serde(default)]
    pub on_timeout: TimeoutAction,

    #[serde(default = "default_sample_window")]
    pub sample_window: Timeout,

    #[serde(default = "default_sample_granularity")]
    pub sample_granularity: Timeout,

    /// Idle connections kept per host
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: Timeout,

    /// Most connections checked out per host at once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_connection_limit: Option<usize>,

    /// Load balancing strategy: round_robin, least_loaded, power_of_two
    #[serde(default)]
    pub balancer: Strategy,

    #[serde(default)]
    pub tcp: TcpConfig,
}

fn default_sample_window() -> Timeout {
    DEFAULT_WINDOW
}

fn default_sample_granularity() -> Timeout {
    DEFAULT_GRANULARITY
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_cache_ttl() -> Timeout {
    Timeout::seconds(5)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            codec: None,
            name: None,
            connect_timeout: None,
            request_timeout: None,
            on_timeout: TimeoutAction::default(),
            sample_window: default_sample_window(),
            sample_granularity: default_sample_granularity(),
            cache_size: default_cache_size(),
            cache_ttl: default_cache_ttl(),
            host_connection_limit: None,
            balancer: Strategy::default(),
            tcp: TcpConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Immutable builder carrying this configuration. Nothing is validated
    /// until [`ClientBuilder::build`].
    pub fn to_builder(&self) -> ClientBuilder {
        let mut builder = ClientBuilder::new()
            .with_endpoints(self.hosts.clone())
            .with_timeout_action(self.on_timeout)
            .with_sample_window(self.sample_window)
            .with_sample_granularity(self.sample_granularity)
            .with_cache_size(self.cache_size)
            .with_cache_ttl(self.cache_ttl)
            .with_strategy(self.balancer)
            .with_tcp_config(self.tcp.clone());

        if let Some(codec) = self.codec {
            builder = builder.with_codec(codec);
        }
        if let Some(name) = &self.name {
            builder = builder.with_name(name.as_str());
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.with_connect_timeout(timeout);
        }
        if let Some(timeout) = self.request_timeout {
            builder = builder.with_request_timeout(timeout);
        }
        if let Some(limit) = self.host_connection_limit {
            builder = builder.with_host_connection_limit(limit);
        }
        builder
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: ClientConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// - RPCPOOL_HOSTS (comma-separated list of endpoints, required)
/// - RPCPOOL_CODEC (http or thrift)
/// - RPCPOOL_NAME
/// - RPCPOOL_CONNECT_TIMEOUT_MS / RPCPOOL_REQUEST_TIMEOUT_MS
/// - RPCPOOL_CACHE_SIZE / RPCPOOL_CACHE_TTL_MS
/// - RPCPOOL_HOST_CONNECTION_LIMIT
/// - RPCPOOL_BALANCER (round_robin, least_loaded, power_of_two)
pub fn load_from_env() -> Result<ClientConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    from_vars(&std::env::vars().collect())
}

/// Build a configuration from a set of `RPCPOOL_*` variables
pub fn from_vars(vars: &HashMap<String, String>) -> Result<ClientConfig> {
    let mut config = ClientConfig::default();

    let hosts = vars
        .get("RPCPOOL_HOSTS")
        .context("RPCPOOL_HOSTS environment variable not set")?;
    config.hosts = Endpoint::parse_list(hosts).context("Invalid RPCPOOL_HOSTS")?;
    if config.hosts.is_empty() {
        anyhow::bail!("RPCPOOL_HOSTS contains no valid endpoints");
    }

    if let Some(codec) = vars.get("RPCPOOL_CODEC") {
        config.codec = Some(codec.parse().context("Invalid RPCPOOL_CODEC")?);
    }

    config.name = vars.get("RPCPOOL_NAME").cloned();

    if let Some(ms) = parse_var::<u64>(vars, "RPCPOOL_CONNECT_TIMEOUT_MS")? {
        config.connect_timeout = Some(Timeout::millis(ms));
    }
    if let Some(ms) = parse_var::<u64>(vars, "RPCPOOL_REQUEST_TIMEOUT_MS")? {
        config.request_timeout = Some(Timeout::millis(ms));
    }
    if let Some(size) = parse_var(vars, "RPCPOOL_CACHE_SIZE")? {
        config.cache_size = size;
    }
    if let Some(ms) = parse_var::<u64>(vars, "RPCPOOL_CACHE_TTL_MS")? {
        config.cache_ttl = Timeout::millis(ms);
    }
    config.host_connection_limit = parse_var(vars, "RPCPOOL_HOST_CONNECTION_LIMIT")?;

    if let Some(strategy) = vars.get("RPCPOOL_BALANCER") {
        config.balancer = strategy.parse().context("Invalid RPCPOOL_BALANCER")?;
    }

    Ok(config)
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    vars.get(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {}: {:?}", key, value))
        })
        .transpose()
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<ClientConfig> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
