use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1056;
pub const DEFAULT_UPSTREAM: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);
pub const DEFAULT_TTL_SECS: u64 = 5;
pub const DEFAULT_MAX_TTL_SECS: u64 = 86_400;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
/// Large enough for any UDP DNS message a resolver will send without TCP fallback.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// Port requested by the operator.
    pub port: u16,
    /// Port tried when `port` cannot be bound.
    pub fallback_port: u16,
    pub upstream: SocketAddr,
    pub upstream_timeout: Duration,
    /// Lifetime of responses whose answers carry no usable TTL.
    pub default_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    /// Read TTLs from upstream answers instead of always using `default_ttl`.
    pub honor_upstream_ttl: bool,
    pub cache_capacity: usize,
    pub buffer_size: usize,
    /// `None` disables the background sweep; expiry is then purely on read.
    pub sweep_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            fallback_port: DEFAULT_PORT,
            upstream: DEFAULT_UPSTREAM,
            upstream_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            min_ttl: Duration::ZERO,
            max_ttl: Duration::from_secs(DEFAULT_MAX_TTL_SECS),
            honor_upstream_ttl: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sweep_interval: Some(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)),
        }
    }
}

impl ServerConfig {
    /// How long to cache a response whose smallest answer TTL is `answer_ttl`.
    pub fn cache_ttl(&self, answer_ttl: Option<u32>) -> Duration {
        match answer_ttl {
            Some(secs) if self.honor_upstream_ttl => Duration::from_secs(u64::from(secs))
                .clamp(self.min_ttl, self.max_ttl.max(self.min_ttl)),
            _ => self.default_ttl,
        }
    }
}
