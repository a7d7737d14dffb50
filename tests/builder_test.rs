use rpcpool::stats::bucket_count;
use rpcpool::{ClientBuilder, Codec, Endpoint, Error, MemoryReceiver, Strategy, TimeUnit, Timeout};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn valid() -> ClientBuilder {
    ClientBuilder::new()
        .with_hosts("rpc-1:9090,rpc-2:9090")
        .with_codec(Codec::Thrift)
}

fn assert_config_error(result: rpcpool::Result<rpcpool::Client>, needle: &str) {
    match result {
        Err(Error::Config(msg)) => assert!(msg.contains(needle), "{msg}"),
        Err(other) => panic!("expected a configuration error, got {other}"),
        Ok(_) => panic!("expected a configuration error"),
    }
}

#[test]
fn test_setters_return_new_values() {
    let base = ClientBuilder::new();
    let named = base.with_name("search");
    let renamed = named.with_name("index");

    assert_eq!(base.name(), None);
    assert_eq!(named.name(), Some("search"));
    assert_eq!(renamed.name(), Some("index"));

    let thrift = base.with_codec(Codec::Thrift);
    let http = thrift.with_codec(Codec::Http);
    assert_eq!(base.codec(), None);
    assert_eq!(thrift.codec(), Some(Codec::Thrift));
    assert_eq!(http.codec(), Some(Codec::Http));

    let two = base.with_hosts("a:1,b:2");
    let one = two.with_endpoints([Endpoint::new("c", 3)]);
    assert!(base.endpoints().unwrap().is_empty());
    assert_eq!(two.endpoints().unwrap().len(), 2);
    assert_eq!(one.endpoints().unwrap(), vec![Endpoint::new("c", 3)]);

    let least = base.with_strategy(Strategy::LeastLoaded);
    assert_eq!(base.strategy(), Strategy::RoundRobin);
    assert_eq!(least.strategy(), Strategy::LeastLoaded);
}

#[test]
fn test_configuration_is_shareable_across_threads() {
    let shared = Arc::new(valid().with_request_timeout(Timeout::millis(100)));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.with_cache_size(i + 1).cache_size())
        })
        .collect();

    let sizes: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(sizes, vec![1, 2, 3, 4]);
    assert_eq!(shared.cache_size(), 10);
    assert_eq!(shared.request_timeout(), Some(Duration::from_millis(100)));
}

#[test]
fn test_missing_endpoints() {
    let builder = ClientBuilder::new().with_codec(Codec::Http);
    assert_config_error(builder.build(), "endpoints");
    assert_config_error(builder.with_hosts(" , ").build(), "endpoints");
}

#[test]
fn test_missing_codec() {
    let builder = ClientBuilder::new().with_hosts("rpc-1:9090");
    assert_config_error(builder.build(), "codec");
}

#[test]
fn test_malformed_hosts() {
    let result = valid().with_hosts("rpc-1:9090,rpc-2").build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_window_smaller_than_granularity() {
    let builder = valid()
        .with_sample_window(Timeout::seconds(5))
        .with_sample_granularity(Timeout::seconds(10));
    assert!(matches!(builder.bucket_count(), Err(Error::Config(_))));
    assert!(matches!(builder.build(), Err(Error::Config(_))));
}

#[test]
fn test_bucket_counts() {
    assert_eq!(
        bucket_count(Timeout::minutes(10).into(), Timeout::seconds(10).into()).unwrap(),
        60
    );
    assert!(bucket_count(Duration::from_secs(3), Duration::from_secs(10)).is_err());
    assert!(bucket_count(Duration::ZERO, Duration::from_secs(1)).is_err());
    assert_eq!(
        valid()
            .with_sample_window(Timeout::new(1, TimeUnit::Hours))
            .with_sample_granularity(Timeout::minutes(1))
            .bucket_count()
            .unwrap(),
        60
    );
}

#[test]
fn test_zero_cache_size() {
    assert_config_error(valid().with_cache_size(0).build(), "cache size");
}

#[test]
fn test_failed_build_publishes_nothing() {
    let receiver = Arc::new(MemoryReceiver::new());
    let result = valid()
        .with_hosts("rpc-1:9090,rpc-2:0")
        .with_stats_receiver(receiver.clone())
        .build();

    assert_config_error(result, "port 0");
    assert!(receiver.gauge_names().is_empty());
}

#[tokio::test]
async fn test_one_configuration_builds_independent_clients() {
    let receiver = Arc::new(MemoryReceiver::new());
    let builder = valid().with_stats_receiver(receiver.clone());

    let first = builder.with_name("first").build().unwrap();
    let second = builder.with_name("second").build().unwrap();

    assert_eq!(first.endpoints(), second.endpoints());
    assert_eq!(first.name(), Some("first"));

    first.close();
    assert!(!first.is_available());
    assert!(second.is_available());

    let gauges = receiver.gauge_names();
    assert!(gauges.contains(&"first_rpc-1:9090/connection_cache_size".to_string()));
    assert!(gauges.contains(&"second_rpc-2:9090/health_score".to_string()));
    second.close();
}

#[tokio::test]
async fn test_unnamed_client_publishes_shared_names() {
    let receiver = Arc::new(MemoryReceiver::new());
    let client = valid().with_stats_receiver(receiver.clone()).build().unwrap();

    assert_eq!(
        receiver.gauge_names(),
        vec!["connection_cache_size", "health_score", "in_flight"]
    );
    assert_eq!(receiver.gauge("health_score"), Some(100.0));
    client.close();
}
