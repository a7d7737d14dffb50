//! Integration tests for the assembled client
//!
//! These tests drive the full host stack (connection factory, caching pool,
//! dispatch pooling, timeout and stats) through the public builder, using a
//! fake transport for exact connection accounting and loopback servers for
//! the real codecs.

use async_trait::async_trait;
use bytes::Bytes;
use rpcpool::codec::Pipeline;
use rpcpool::pool::CachingPool;
use rpcpool::service::{BoxService, Service, ServiceFactory};
use rpcpool::{
    ClientBuilder, Codec, Endpoint, Error, MemoryReceiver, Result, TimeoutAction, Timeout,
    Transport,
};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Echoes requests. `hang` never completes, `slow` takes 200ms.
struct FakeConnection {
    busy: AtomicBool,
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for FakeConnection {
    async fn dispatch(&self, request: Bytes) -> Result<Bytes> {
        self.busy.store(true, Ordering::SeqCst);
        match request.as_ref() {
            b"hang" => std::future::pending::<()>().await,
            b"slow" => tokio::time::sleep(Duration::from_millis(200)).await,
            _ => {}
        }
        self.busy.store(false, Ordering::SeqCst);
        Ok(request)
    }

    fn is_available(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    fn release(self: Box<Self>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeTransport {
    connects: AtomicUsize,
    released: Arc<AtomicUsize>,
    shut_down: AtomicBool,
    /// Port whose next `refusals` connects fail
    refused_port: AtomicU16,
    refusals: AtomicUsize,
}

impl FakeTransport {
    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn refuse(&self, port: u16, times: usize) {
        self.refused_port.store(port, Ordering::SeqCst);
        self.refusals.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, endpoint: &Endpoint, _pipeline: &dyn Pipeline) -> Result<BoxService> {
        if endpoint.port == self.refused_port.load(Ordering::SeqCst)
            && self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::Connect {
                endpoint: endpoint.clone(),
                reason: "connection refused".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            busy: AtomicBool::new(false),
            released: Arc::clone(&self.released),
        }))
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

fn builder(transport: &Arc<FakeTransport>) -> ClientBuilder {
    ClientBuilder::new()
        .with_codec(Codec::Thrift)
        .with_transport(transport.clone())
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out_and_pool_stays_usable() {
    let transport = Arc::new(FakeTransport::default());
    let client = builder(&transport)
        .with_hosts("rpc-1:9090,rpc-2:9090")
        .with_request_timeout(Timeout::millis(100))
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = client.dispatch(Bytes::from_static(b"hang")).await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_millis(200));

    // The interrupted connection is discarded, never cached
    assert_eq!(transport.released(), 1);

    for _ in 0..4 {
        let reply = client.dispatch(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(reply, "ping");
    }
    assert!(client.is_available());

    // Timeouts are not connection failures: the host is still healthy
    let hosts = client.host_stats();
    assert_eq!(hosts.len(), 2);
    assert!(hosts.iter().all(|host| host.healthy));
    assert_eq!(hosts.iter().map(|host| host.requests).sum::<u64>(), 5);
    assert_eq!(hosts.iter().map(|host| host.failures).sum::<u64>(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_is_not_reused() {
    struct CountingFactory {
        made: AtomicUsize,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceFactory for CountingFactory {
        async fn make(&self) -> Result<BoxService> {
            self.made.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                busy: AtomicBool::new(false),
                released: Arc::clone(&self.released),
            }))
        }

        fn is_available(&self) -> bool {
            true
        }

        fn close(&self) {}
    }

    let released = Arc::new(AtomicUsize::new(0));
    let pool = CachingPool::new(
        CountingFactory {
            made: AtomicUsize::new(0),
            released: Arc::clone(&released),
        },
        1,
        Duration::from_millis(50),
    );

    let service = pool.make().await.unwrap();
    service.release();
    assert_eq!(pool.cached(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(pool.cached(), 0);
    assert_eq!(released.load(Ordering::SeqCst), 1);

    let _service = pool.make().await.unwrap();
    assert_eq!(pool.stats().total_created, 2);
    assert_eq!(pool.stats().total_reused, 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_reconnects_after_ttl() {
    let transport = Arc::new(FakeTransport::default());
    let client = builder(&transport)
        .with_hosts("rpc-1:9090")
        .with_cache_size(1)
        .with_cache_ttl(Timeout::millis(50))
        .build()
        .unwrap();

    client.dispatch(Bytes::from_static(b"a")).await.unwrap();
    client.dispatch(Bytes::from_static(b"b")).await.unwrap();
    assert_eq!(transport.connects(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    client.dispatch(Bytes::from_static(b"c")).await.unwrap();
    assert_eq!(transport.connects(), 2);
    assert_eq!(transport.released(), 1);
}

#[tokio::test]
async fn test_sequential_dispatches_reuse_one_connection() {
    let transport = Arc::new(FakeTransport::default());
    let client = builder(&transport).with_hosts("rpc-1:9090").build().unwrap();

    for i in 0..10 {
        let reply = client.dispatch(format!("req-{i}")).await.unwrap();
        assert_eq!(reply, format!("req-{i}"));
    }
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_host_connection_limit_serializes_checkouts() {
    let transport = Arc::new(FakeTransport::default());
    let client = Arc::new(
        builder(&transport)
            .with_hosts("rpc-1:9090")
            .with_host_connection_limit(1)
            .build()
            .unwrap(),
    );

    let first = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.dispatch(Bytes::from_static(b"slow")).await }
    });
    let second = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.dispatch(Bytes::from_static(b"slow")).await }
    });

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    // The second dispatch waited for the first and reused its connection
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_dispatch_returns_connection_to_cache() {
    let transport = Arc::new(FakeTransport::default());
    let client = builder(&transport)
        .with_hosts("rpc-1:9090")
        .with_request_timeout(Timeout::millis(100))
        .with_timeout_action(TimeoutAction::Abandon)
        .build()
        .unwrap();

    let err = client.dispatch(Bytes::from_static(b"slow")).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // Let the abandoned dispatch finish and re-cache its connection
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.dispatch(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.released(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_dispatch_discards_connection() {
    let transport = Arc::new(FakeTransport::default());
    let client = builder(&transport)
        .with_hosts("rpc-1:9090")
        .with_request_timeout(Timeout::millis(100))
        .build()
        .unwrap();

    assert!(client.dispatch(Bytes::from_static(b"slow")).await.is_err());
    client.dispatch(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(transport.connects(), 2);
    assert_eq!(transport.released(), 1);
}

#[tokio::test]
async fn test_close_releases_idle_connections() {
    let transport = Arc::new(FakeTransport::default());
    let client = builder(&transport)
        .with_hosts("rpc-1:9090,rpc-2:9090")
        .build()
        .unwrap();

    client.dispatch(Bytes::from_static(b"a")).await.unwrap();
    client.dispatch(Bytes::from_static(b"b")).await.unwrap();
    assert_eq!(transport.connects(), 2);

    client.close();
    client.close();
    assert!(!client.is_available());
    assert_eq!(transport.released(), 2);
    assert!(matches!(
        client.dispatch(Bytes::from_static(b"c")).await,
        Err(Error::FactoryClosed)
    ));

    // A shared transport outlives the client
    assert!(!transport.is_shut_down());
}

#[tokio::test]
async fn test_dropped_client_releases_idle_connections() {
    let transport = Arc::new(FakeTransport::default());
    let client = builder(&transport)
        .with_hosts("rpc-1:9090,rpc-2:9090")
        .build()
        .unwrap();

    client.dispatch(Bytes::from_static(b"a")).await.unwrap();
    client.dispatch(Bytes::from_static(b"b")).await.unwrap();
    assert_eq!(transport.released(), 0);

    drop(client);
    assert_eq!(transport.released(), 2);
}

#[tokio::test]
async fn test_stats_published_under_host_labels() {
    let transport = Arc::new(FakeTransport::default());
    let receiver = Arc::new(MemoryReceiver::new());
    let client = builder(&transport)
        .with_hosts("rpc-1:9090")
        .with_name("search")
        .with_stats_receiver(receiver.clone())
        .build()
        .unwrap();

    client.dispatch(Bytes::from_static(b"a")).await.unwrap();
    client.dispatch(Bytes::from_static(b"b")).await.unwrap();

    let label = "search_rpc-1:9090";
    assert_eq!(receiver.sample(&format!("{label}/requests")).unwrap().count, 2);
    assert_eq!(receiver.sample(&format!("{label}/success")).unwrap().count, 2);
    assert!(receiver.sample(&format!("{label}/request_latency_ms")).is_some());
    assert_eq!(receiver.gauge(&format!("{label}/connection_cache_size")), Some(1.0));
    assert_eq!(receiver.gauge(&format!("{label}/in_flight")), Some(0.0));
    assert_eq!(receiver.gauge(&format!("{label}/health_score")), Some(100.0));
}

#[tokio::test(start_paused = true)]
async fn test_refused_host_recovers_after_retry_interval() {
    let transport = Arc::new(FakeTransport::default());
    transport.refuse(2, 1);
    let client = builder(&transport).with_hosts("a:1,b:2").build().unwrap();

    assert_eq!(client.dispatch("first").await.unwrap(), "first");
    let err = client.dispatch("second").await.unwrap_err();
    assert!(err.is_connect_failure(), "unexpected error: {err}");
    assert!(!client.host_stats()[1].healthy);

    for _ in 0..100 {
        client.dispatch("ping").await.unwrap();
    }
    assert_eq!(client.host_stats()[1].requests, 1);

    tokio::time::advance(rpcpool::stats::DEFAULT_RETRY_INTERVAL).await;
    for _ in 0..10 {
        client.dispatch("ping").await.unwrap();
    }

    let hosts = client.host_stats();
    assert!(hosts[1].healthy);
    assert!(hosts[1].requests >= 6, "b served {} requests", hosts[1].requests);
    assert_eq!(hosts[1].failures, 1);
    client.close();
}

mod loopback {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn framed_echo_server() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut header = [0u8; 4];
                    while socket.read_exact(&mut header).await.is_ok() {
                        let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
                        if socket.read_exact(&mut payload).await.is_err() {
                            return;
                        }
                        let _ = socket.write_all(&header).await;
                        let _ = socket.write_all(&payload).await;
                    }
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    /// Answers one frame per connection, then hangs up
    async fn framed_one_shot_server(accepted: Arc<AtomicUsize>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut header = [0u8; 4];
                    if socket.read_exact(&mut header).await.is_err() {
                        return;
                    }
                    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
                    if socket.read_exact(&mut payload).await.is_err() {
                        return;
                    }
                    let _ = socket.write_all(&header).await;
                    let _ = socket.write_all(&payload).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    /// Answers one HTTP request per connection without announcing the close,
    /// then hangs up
    async fn http_one_shot_server(accepted: Arc<AtomicUsize>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let body_start = loop {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };

                    let head = String::from_utf8_lossy(&buf[..body_start]).to_ascii_lowercase();
                    let len = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|value| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    while buf.len() < body_start + len {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }

                    let body = &buf[body_start..body_start + len];
                    let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", body.len());
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    async fn assert_reconnects_after_idle_close(codec: Codec, endpoint: Endpoint, accepted: &AtomicUsize) {
        let client = ClientBuilder::new()
            .with_endpoints([endpoint])
            .with_codec(codec)
            .with_connect_timeout(Timeout::seconds(2))
            .with_request_timeout(Timeout::seconds(2))
            .build()
            .unwrap();

        for (i, payload) in ["one", "two", "three"].into_iter().enumerate() {
            assert_eq!(client.dispatch(payload).await.unwrap(), payload);
            assert_eq!(accepted.load(Ordering::SeqCst), i + 1);

            // Let the hang-up reach the cached connection
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let host = &client.host_stats()[0];
        assert_eq!(host.failures, 0);
        assert_eq!(host.health_score, 100);
        client.close();
    }

    async fn echo(request: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let body = request.into_body().collect().await.unwrap().to_bytes();
        Ok(Response::new(Full::new(body)))
    }

    async fn http_echo_server() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(socket), service_fn(echo))
                        .await;
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_thrift_over_tcp() {
        let endpoints = vec![framed_echo_server().await, framed_echo_server().await];
        let client = ClientBuilder::new()
            .with_endpoints(endpoints)
            .with_codec(Codec::Thrift)
            .with_connect_timeout(Timeout::seconds(2))
            .with_request_timeout(Timeout::seconds(2))
            .build()
            .unwrap();

        for i in 0..6 {
            let reply = client.dispatch(format!("frame-{i}")).await.unwrap();
            assert_eq!(reply, format!("frame-{i}"));
        }

        let hosts = client.host_stats();
        assert_eq!(hosts.iter().map(|host| host.requests).sum::<u64>(), 6);
        assert!(hosts.iter().all(|host| host.requests == 3));
        client.close();
    }

    #[tokio::test]
    async fn test_http_over_tcp() {
        let endpoint = http_echo_server().await;
        let client = ClientBuilder::new()
            .with_endpoints([endpoint])
            .with_codec(Codec::Http)
            .with_request_timeout(Timeout::seconds(2))
            .build()
            .unwrap();

        assert_eq!(client.dispatch("hello").await.unwrap(), "hello");
        assert_eq!(client.dispatch("again").await.unwrap(), "again");
        client.close();
        assert!(client.dispatch("closed").await.is_err());
    }

    #[tokio::test]
    async fn test_thrift_reconnects_when_server_closes_idle_connection() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let endpoint = framed_one_shot_server(accepted.clone()).await;
        assert_reconnects_after_idle_close(Codec::Thrift, endpoint, &accepted).await;
    }

    #[tokio::test]
    async fn test_http_reconnects_when_server_closes_idle_connection() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let endpoint = http_one_shot_server(accepted.clone()).await;
        assert_reconnects_after_idle_close(Codec::Http, endpoint, &accepted).await;
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_connection_failure() {
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = ClientBuilder::new()
            .with_endpoints([Endpoint::new("127.0.0.1", port)])
            .with_codec(Codec::Thrift)
            .build()
            .unwrap();

        let err = client.dispatch("x").await.unwrap_err();
        assert!(err.is_connect_failure(), "unexpected error: {err}");
        assert!(!err.is_timeout());
        assert!(!client.host_stats()[0].healthy);
    }
}
