use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dns_forwarder::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CACHE_CAPACITY, DEFAULT_PORT, DEFAULT_SWEEP_INTERVAL_SECS,
    DEFAULT_TIMEOUT_MS, DEFAULT_TTL_SECS, DEFAULT_UPSTREAM,
};
use dns_forwarder::{DnsServer, ServerConfig};
use tracing::level_filters::LevelFilter;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dns-forwarder")]
#[command(about = "Caching DNS forwarder")]
struct Args {
    /// Port to listen on; falls back to 1056 when it cannot be bound
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Upstream DNS resolver address (e.g., 8.8.8.8:53)
    #[arg(long, default_value_t = DEFAULT_UPSTREAM)]
    resolver: SocketAddr,

    /// Seconds to cache a response whose answers carry no TTL
    #[arg(long, default_value_t = DEFAULT_TTL_SECS)]
    default_ttl: u64,

    /// Always cache for --default-ttl instead of reading TTLs from answers
    #[arg(long)]
    fixed_ttl: bool,

    /// Milliseconds to wait for the upstream before dropping a query
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Maximum number of cached names
    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY)]
    cache_capacity: usize,

    /// Receive buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Seconds between sweeps of expired entries (0 disables the sweep)
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval: u64,

    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(long)]
    log_level: Option<Level>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            upstream: self.resolver,
            upstream_timeout: Duration::from_millis(self.timeout_ms),
            default_ttl: Duration::from_secs(self.default_ttl),
            honor_upstream_ttl: !self.fixed_ttl,
            cache_capacity: self.cache_capacity,
            buffer_size: self.buffer_size.max(512),
            sweep_interval: (self.sweep_interval > 0)
                .then(|| Duration::from_secs(self.sweep_interval)),
            ..ServerConfig::default()
        }
    }
}

fn init_logging(level: Option<Level>) {
    let filter = match level {
        Some(level) => EnvFilter::default().add_directive(LevelFilter::from_level(level).into()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    info!("Starting dns-forwarder v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();
    let server = match DnsServer::bind(config).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "Cannot serve without a listening socket");
            return Err(e).context("failed to start DNS forwarder");
        }
    };

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await;
    Ok(())
}
