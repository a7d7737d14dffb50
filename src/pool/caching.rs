//! Caching pool: a [`ServiceFactory`] decorator that reuses released
//! connections instead of reconnecting
//!
//! `make()` first drains the idle cache, discarding entries that are no longer
//! available, and only falls back to the underlying factory when nothing
//! reusable is cached. Every service handed out is wrapped in a proxy whose
//! `release()` puts the connection back in the cache while the pool is open
//! and the connection is still available, and truly releases it otherwise.
//!
//! The open flag and the cache are coordinated through one `RwLock`: proxies
//! re-cache under the read side, `close()` flips the flag and drains the cache
//! under the write side. A connection therefore can never slip into the cache
//! after it has been drained.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use super::cache::TtlCache;
use crate::error::{Error, Result};
use crate::service::{BoxService, Layer, Service, ServiceFactory, SharedFactory};

/// Default number of idle connections kept per host
pub const DEFAULT_CACHE_SIZE: usize = 10;

/// Default idle lifetime of a cached connection
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Counters describing how a caching pool has been used
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachingPoolStats {
    /// Services obtained from the underlying factory
    pub total_created: u64,

    /// Services served from the cache
    pub total_reused: u64,

    /// Cached services discarded because they were no longer available
    pub total_discarded: u64,

    /// Services currently idle in the cache
    pub idle: usize,
}

struct Shared {
    cache: TtlCache<BoxService>,
    open: RwLock<bool>,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl Shared {
    fn is_open(&self) -> bool {
        *self.open.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a service to the cache if it is reusable, else release it
    fn recycle(&self, service: BoxService) {
        let rejected = {
            let open = self.open.read().unwrap_or_else(PoisonError::into_inner);
            if *open && service.is_available() {
                self.cache.put(service);
                None
            } else {
                Some(service)
            }
        };

        if let Some(service) = rejected {
            debug!("Releasing connection instead of caching it");
            service.release();
        }
    }
}

/// [`ServiceFactory`] decorator backed by a [`TtlCache`]
pub struct CachingPool<F> {
    underlying: F,
    shared: Arc<Shared>,
}

impl<F: ServiceFactory> CachingPool<F> {
    /// Wrap `underlying`, caching at most `cache_size` idle services for at
    /// most `ttl` each
    pub fn new(underlying: F, cache_size: usize, ttl: Duration) -> Self {
        let cache = TtlCache::new(cache_size, ttl, |service: BoxService| {
            debug!("Evicting idle connection");
            service.release();
        });

        Self {
            underlying,
            shared: Arc::new(Shared {
                cache,
                open: RwLock::new(true),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Number of idle services currently cached
    pub fn cached(&self) -> usize {
        self.shared.cache.size()
    }

    /// Gauge closure reporting the idle cache size
    pub fn size_gauge(&self) -> impl Fn() -> usize + Send + Sync + 'static {
        self.shared.cache.size_gauge()
    }

    pub fn stats(&self) -> CachingPoolStats {
        CachingPoolStats {
            total_created: self.shared.created.load(Ordering::Relaxed),
            total_reused: self.shared.reused.load(Ordering::Relaxed),
            total_discarded: self.shared.discarded.load(Ordering::Relaxed),
            idle: self.shared.cache.size(),
        }
    }

    /// Take the first available cached service, releasing stale ones. Each
    /// iteration removes one entry, so the loop ends once the cache is empty.
    fn take_cached(&self) -> Result<Option<BoxService>> {
        loop {
            let cached = {
                let open = self.shared.open.read().unwrap_or_else(PoisonError::into_inner);
                if !*open {
                    return Err(Error::FactoryClosed);
                }
                self.shared.cache.get()
            };

            match cached {
                Some(service) if service.is_available() => return Ok(Some(service)),
                Some(service) => {
                    self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                    debug!("Discarding unavailable cached connection");
                    service.release();
                }
                None => return Ok(None),
            }
        }
    }

    fn wrap(&self, service: BoxService) -> BoxService {
        Box::new(CachedService {
            inner: service,
            pool: Arc::clone(&self.shared),
        })
    }
}

#[async_trait]
impl<F: ServiceFactory> ServiceFactory for CachingPool<F> {
    async fn make(&self) -> Result<BoxService> {
        if let Some(service) = self.take_cached()? {
            self.shared.reused.fetch_add(1, Ordering::Relaxed);
            debug!(idle = self.shared.cache.size(), "Reusing cached connection");
            return Ok(self.wrap(service));
        }

        let service = self.underlying.make().await?;
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        Ok(self.wrap(service))
    }

    fn is_available(&self) -> bool {
        self.shared.is_open() && self.underlying.is_available()
    }

    fn close(&self) {
        {
            let mut open = self.shared.open.write().unwrap_or_else(PoisonError::into_inner);
            if !*open {
                return;
            }
            *open = false;
            self.shared.cache.evict_all();
        }

        info!(
            created = self.shared.created.load(Ordering::Relaxed),
            reused = self.shared.reused.load(Ordering::Relaxed),
            "Caching pool closed"
        );
        self.underlying.close();
    }
}

/// Proxy that intercepts `release()` to recycle the connection
struct CachedService {
    inner: BoxService,
    pool: Arc<Shared>,
}

#[async_trait]
impl Service for CachedService {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        self.inner.dispatch(request).await
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn release(self: Box<Self>) {
        let CachedService { inner, pool } = *self;
        pool.recycle(inner);
    }
}

/// Layer adding a caching pool on top of a raw factory
#[derive(Debug, Clone, Copy)]
pub struct CachingPoolLayer {
    pub cache_size: usize,
    pub ttl: Duration,
}

impl CachingPoolLayer {
    pub fn new(cache_size: usize, ttl: Duration) -> Self {
        Self { cache_size, ttl }
    }
}

impl Default for CachingPoolLayer {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL)
    }
}

impl Layer<SharedFactory> for CachingPoolLayer {
    type Output = Arc<CachingPool<SharedFactory>>;

    fn layer(&self, inner: SharedFactory) -> Self::Output {
        Arc::new(CachingPool::new(inner, self.cache_size, self.ttl))
    }
}
