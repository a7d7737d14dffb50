//! Immutable client configuration and assembly
//!
//! Every `with_*` setter returns a new builder with one field replaced and
//! leaves the receiver untouched, so partial configurations can be shared
//! across threads and branched freely. [`ClientBuilder::build`] validates the
//! configuration and wires, for every endpoint:
//!
//! ```text
//! ConnectionFactory -> CachingPool -> DispatchPool -> TimeoutFilter -> StatsFilter
//! ```
//!
//! and puts a [`LoadBalancer`] in front of all hosts. Pooling and timeouts
//! sit below stats so recorded latency is the real dispatch time; stats sit
//! below balancing so the balancer can consult per-host health.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Client;
use crate::codec::{Codec, SharedPipeline};
use crate::error::{Error, Result};
use crate::filter::{StatsLayer, TimeoutAction, TimeoutLayer};
use crate::lb::{HostHandle, LoadBalancer, Strategy};
use crate::pool::{CachingPoolLayer, DispatchPoolLayer, DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL};
use crate::service::{Layer, SharedFactory};
use crate::stats::{
    bucket_count, host_label, HostStats, StatsReceiver, StatsRepository, CACHE_SIZE,
    DEFAULT_GRANULARITY, DEFAULT_WINDOW,
};
use crate::transport::{ConnectionFactory, Endpoint, SharedTransport, TcpConfig, TcpTransport};

#[derive(Debug, Clone, PartialEq)]
enum Hosts {
    Unparsed(String),
    List(Vec<Endpoint>),
}

/// Immutable client configuration
#[derive(Clone)]
pub struct ClientBuilder {
    hosts: Option<Hosts>,
    codec: Option<Codec>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    stats_receiver: Option<Arc<dyn StatsReceiver>>,
    sample_window: Duration,
    sample_granularity: Duration,
    name: Option<String>,
    cache_size: usize,
    cache_ttl: Duration,
    host_connection_limit: Option<usize>,
    strategy: Strategy,
    timeout_action: TimeoutAction,
    transport: Option<SharedTransport>,
    tcp: TcpConfig,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            hosts: None,
            codec: None,
            connect_timeout: None,
            request_timeout: None,
            stats_receiver: None,
            sample_window: DEFAULT_WINDOW.duration(),
            sample_granularity: DEFAULT_GRANULARITY.duration(),
            name: None,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            host_connection_limit: None,
            strategy: Strategy::default(),
            timeout_action: TimeoutAction::default(),
            transport: None,
            tcp: TcpConfig::default(),
        }
    }
}

/// One assembled host before it is published
struct Assembled {
    handle: HostHandle,
    cache_size: Box<dyn Fn() -> usize + Send + Sync>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(&self, update: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        update(&mut next);
        next
    }

    /// Endpoints as a `host:port,host:port` list, parsed at build time
    pub fn with_hosts(&self, hosts: &str) -> Self {
        let hosts = hosts.to_string();
        self.with(|b| b.hosts = Some(Hosts::Unparsed(hosts)))
    }

    pub fn with_endpoints(&self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let endpoints = endpoints.into_iter().collect();
        self.with(|b| b.hosts = Some(Hosts::List(endpoints)))
    }

    pub fn with_codec(&self, codec: Codec) -> Self {
        self.with(|b| b.codec = Some(codec))
    }

    /// Upper bound on establishing a connection
    pub fn with_connect_timeout(&self, timeout: impl Into<Duration>) -> Self {
        let timeout = timeout.into();
        self.with(|b| b.connect_timeout = Some(timeout))
    }

    /// Upper bound on a single dispatch; unbounded unless set
    pub fn with_request_timeout(&self, timeout: impl Into<Duration>) -> Self {
        let timeout = timeout.into();
        self.with(|b| b.request_timeout = Some(timeout))
    }

    /// Publish per-host stats to `receiver`. Hosts are told apart by the
    /// client name. Without one, every host publishes under the bare metric
    /// names, so samples merge and the last host registered owns each gauge.
    pub fn with_stats_receiver(&self, receiver: Arc<dyn StatsReceiver>) -> Self {
        self.with(|b| b.stats_receiver = Some(receiver))
    }

    pub fn with_sample_window(&self, window: impl Into<Duration>) -> Self {
        let window = window.into();
        self.with(|b| b.sample_window = window)
    }

    pub fn with_sample_granularity(&self, granularity: impl Into<Duration>) -> Self {
        let granularity = granularity.into();
        self.with(|b| b.sample_granularity = granularity)
    }

    /// Prefix for published per-host stat names
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.with(|b| b.name = Some(name))
    }

    /// Idle connections kept per host
    pub fn with_cache_size(&self, size: usize) -> Self {
        self.with(|b| b.cache_size = size)
    }

    /// Idle lifetime of a cached connection
    pub fn with_cache_ttl(&self, ttl: impl Into<Duration>) -> Self {
        let ttl = ttl.into();
        self.with(|b| b.cache_ttl = ttl)
    }

    /// Most connections checked out per host at once
    pub fn with_host_connection_limit(&self, limit: usize) -> Self {
        self.with(|b| b.host_connection_limit = Some(limit))
    }

    pub fn with_strategy(&self, strategy: Strategy) -> Self {
        self.with(|b| b.strategy = strategy)
    }

    pub fn with_timeout_action(&self, action: TimeoutAction) -> Self {
        self.with(|b| b.timeout_action = action)
    }

    /// Transport shared with other clients. Without one, `build()` creates a
    /// private [`TcpTransport`] owned by the client.
    pub fn with_transport(&self, transport: SharedTransport) -> Self {
        self.with(|b| b.transport = Some(transport))
    }

    /// Socket options for the private transport
    pub fn with_tcp_config(&self, tcp: TcpConfig) -> Self {
        self.with(|b| b.tcp = tcp)
    }

    pub fn codec(&self) -> Option<Codec> {
        self.codec
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn sample_window(&self) -> Duration {
        self.sample_window
    }

    pub fn sample_granularity(&self) -> Duration {
        self.sample_granularity
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn host_connection_limit(&self) -> Option<usize> {
        self.host_connection_limit
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn timeout_action(&self) -> TimeoutAction {
        self.timeout_action
    }

    pub fn has_stats_receiver(&self) -> bool {
        self.stats_receiver.is_some()
    }

    /// Configured endpoints, parsing a host list if one was given
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        match &self.hosts {
            None => Ok(Vec::new()),
            Some(Hosts::List(endpoints)) => Ok(endpoints.clone()),
            Some(Hosts::Unparsed(hosts)) => Endpoint::parse_list(hosts),
        }
    }

    /// Rolling buckets each host's samples are kept in
    pub fn bucket_count(&self) -> Result<usize> {
        bucket_count(self.sample_window, self.sample_granularity)
    }

    /// Validate the configuration and assemble a client
    pub fn build(&self) -> Result<Client> {
        let endpoints = self.endpoints()?;
        if endpoints.is_empty() {
            return Err(Error::config("no endpoints configured"));
        }
        let codec = self
            .codec
            .ok_or_else(|| Error::config("no codec configured"))?;
        let bucket_count = self.bucket_count()?;
        if self.cache_size == 0 {
            return Err(Error::config("cache size must be at least 1"));
        }
        if self.host_connection_limit == Some(0) {
            return Err(Error::config("host connection limit must be at least 1"));
        }

        let (transport, owns_transport): (SharedTransport, bool) = match &self.transport {
            Some(transport) => (Arc::clone(transport), false),
            None => (Arc::new(TcpTransport::new(self.tcp.clone())), true),
        };
        let pipeline = codec.pipeline();

        let mut assembled: Vec<Assembled> = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            match self.assemble_host(endpoint, bucket_count, &pipeline, &transport) {
                Ok(host) => assembled.push(host),
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        rolled_back = assembled.len(),
                        "Client assembly failed, closing hosts already built"
                    );
                    for host in &assembled {
                        host.handle.dispatcher.close();
                    }
                    if owns_transport {
                        transport.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        if self.stats_receiver.is_some() && self.name.is_none() && assembled.len() > 1 {
            warn!(
                hosts = assembled.len(),
                "Stats receiver configured without a client name, hosts share metric names"
            );
        }

        // Publish gauges only once the whole client exists
        let mut hosts = Vec::with_capacity(assembled.len());
        for Assembled { handle, cache_size } in assembled {
            handle.stats.register_gauges();
            handle
                .stats
                .repository()
                .register_gauge(CACHE_SIZE, Box::new(move || cache_size() as f64));
            hosts.push(handle);
        }

        info!(
            name = self.name.as_deref().unwrap_or("-"),
            hosts = hosts.len(),
            codec = %codec,
            strategy = %self.strategy,
            request_timeout = ?self.request_timeout,
            "Client built"
        );

        Ok(Client::new(
            LoadBalancer::new(hosts, self.strategy),
            transport,
            owns_transport,
            self.name.clone(),
        ))
    }

    fn assemble_host(
        &self,
        endpoint: &Endpoint,
        bucket_count: usize,
        pipeline: &SharedPipeline,
        transport: &SharedTransport,
    ) -> Result<Assembled> {
        if endpoint.port == 0 {
            return Err(Error::config(format!("endpoint {} has port 0", endpoint)));
        }

        let raw: SharedFactory = Arc::new(ConnectionFactory::new(
            endpoint.clone(),
            Arc::clone(pipeline),
            Arc::clone(transport),
            self.connect_timeout,
        ));
        let caching = CachingPoolLayer::new(self.cache_size, self.cache_ttl).layer(raw);
        let cache_size = caching.size_gauge();
        let pooled = DispatchPoolLayer::new(self.host_connection_limit).layer(caching);
        let timed = TimeoutLayer::new(self.request_timeout, self.timeout_action).layer(pooled);

        let repository = match &self.stats_receiver {
            Some(receiver) => StatsRepository::with_receiver(
                bucket_count,
                self.sample_granularity,
                Arc::clone(receiver),
                host_label(self.name.as_deref(), endpoint),
            ),
            None => StatsRepository::in_memory(bucket_count, self.sample_granularity),
        };
        let stats = Arc::new(HostStats::new(endpoint.clone(), repository));
        let measured = StatsLayer::new(Arc::clone(&stats)).layer(timed);

        debug!(endpoint = %endpoint, published = stats.repository().is_published(), "Host assembled");
        Ok(Assembled {
            handle: HostHandle::new(Arc::new(measured), stats),
            cache_size: Box::new(cache_size),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("hosts", &self.hosts)
            .field("codec", &self.codec)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("stats_receiver", &self.stats_receiver.is_some())
            .field("sample_window", &self.sample_window)
            .field("sample_granularity", &self.sample_granularity)
            .field("name", &self.name)
            .field("cache_size", &self.cache_size)
            .field("cache_ttl", &self.cache_ttl)
            .field("host_connection_limit", &self.host_connection_limit)
            .field("strategy", &self.strategy)
            .field("timeout_action", &self.timeout_action)
            .field("shared_transport", &self.transport.is_some())
            .field("tcp", &self.tcp)
            .finish()
    }
}
