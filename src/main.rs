use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rpcpool::cli::{cmd_probe, cmd_send};
use rpcpool::codec::Codec;
use rpcpool::config::{self, ClientConfig};
use rpcpool::timeout::Timeout;
use rpcpool::transport::Endpoint;

#[derive(Parser)]
#[command(name = "rpcpool")]
#[command(version, about = "RPC client with connection caching and load balancing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Endpoints (comma-separated host:port), overriding the config
    #[arg(long, global = true)]
    hosts: Option<String>,

    /// Wire protocol (http, thrift), overriding the config
    #[arg(long, global = true)]
    codec: Option<Codec>,

    /// Request timeout in milliseconds, overriding the config
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the reply
    Send {
        /// Request payload
        payload: String,
    },

    /// Send many requests and summarize per host
    Probe {
        /// Total number of requests
        #[arg(long, default_value = "100")]
        requests: usize,

        /// Requests in flight at once
        #[arg(long, default_value = "8")]
        concurrency: usize,

        /// Request payload
        #[arg(long, default_value = "ping")]
        payload: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

/// Configuration from the file or environment, with command-line overrides
fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match (&cli.config, &cli.hosts) {
        // Hosts on the command line are enough on their own
        (None, Some(_)) => ClientConfig::default(),
        (path, _) => config::load_config(path.as_deref())?,
    };

    if let Some(hosts) = &cli.hosts {
        config.hosts = Endpoint::parse_list(hosts).context("Invalid --hosts")?;
    }
    if let Some(codec) = cli.codec {
        config.codec = Some(codec);
    }
    if let Some(ms) = cli.request_timeout_ms {
        config.request_timeout = Some(Timeout::millis(ms));
    }
    Ok(config)
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let client = config
        .to_builder()
        .build()
        .context("Failed to build client")?;

    let result = match cli.command {
        Commands::Send { payload } => cmd_send(&client, &payload).await,
        Commands::Probe {
            requests,
            concurrency,
            payload,
        } => cmd_probe(&client, requests, concurrency, &payload).await,
    };

    client.close();
    result
}
