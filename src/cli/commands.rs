use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::client::Client;
use crate::stats::HostSnapshot;

/// Send one request and print the reply
pub async fn cmd_send(client: &Client, payload: &str) -> Result<()> {
    let started = Instant::now();
    let reply = client
        .dispatch(Bytes::copy_from_slice(payload.as_bytes()))
        .await
        .context("Request failed")?;

    debug!(elapsed = ?started.elapsed(), bytes = reply.len(), "Reply received");
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

/// Outcome of a probe run
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub requests: usize,
    pub succeeded: usize,
    /// Failure counts keyed by error kind
    pub failures: BTreeMap<&'static str, usize>,
    pub elapsed: Duration,
    pub hosts: Vec<HostSnapshot>,
}

impl ProbeReport {
    pub fn failed(&self) -> usize {
        self.failures.values().sum()
    }

    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.requests as f64 / secs
        } else {
            0.0
        }
    }
}

/// Send `requests` requests with at most `concurrency` in flight
pub async fn run_probe(
    client: &Client,
    requests: usize,
    concurrency: usize,
    payload: Bytes,
) -> Result<ProbeReport> {
    use futures::stream::{self, StreamExt};

    info!(requests, concurrency, "Starting probe");
    let started = Instant::now();

    let results: Vec<crate::error::Result<Bytes>> = stream::iter(0..requests)
        .map(|_| client.dispatch(payload.clone()))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut succeeded = 0;
    let mut failures = BTreeMap::new();
    for result in results {
        match result {
            Ok(_) => succeeded += 1,
            Err(e) => {
                debug!(error = %e, "Probe request failed");
                *failures.entry(e.kind().as_str()).or_insert(0) += 1;
            }
        }
    }

    Ok(ProbeReport {
        requests,
        succeeded,
        failures,
        elapsed: started.elapsed(),
        hosts: client.host_stats(),
    })
}

/// Run a probe and print a per-host summary
pub async fn cmd_probe(client: &Client, requests: usize, concurrency: usize, payload: &str) -> Result<()> {
    let report = run_probe(
        client,
        requests,
        concurrency,
        Bytes::copy_from_slice(payload.as_bytes()),
    )
    .await?;

    println!(
        "{} requests in {:.2}s ({:.1} req/s): {} ok, {} failed",
        report.requests,
        report.elapsed.as_secs_f64(),
        report.requests_per_sec(),
        report.succeeded,
        report.failed()
    );
    for (kind, count) in &report.failures {
        println!("  {:<12} {}", kind, count);
    }

    println!();
    println!(
        "{:<30} {:>8} {:>8} {:>8} {:>10} {:>7}",
        "HOST", "REQS", "FAILS", "HEALTH", "MEAN(ms)", "STATUS"
    );
    for host in &report.hosts {
        println!(
            "{:<30} {:>8} {:>8} {:>8} {:>10} {:>7}",
            host.endpoint.to_string(),
            host.requests,
            host.failures,
            host.health_score,
            host.mean_latency_ms
                .map(|ms| format!("{:.1}", ms))
                .unwrap_or_else(|| "-".to_string()),
            if host.healthy { "up" } else { "down" }
        );
    }

    Ok(())
}
