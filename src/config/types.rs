use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration for rfgwd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Billing HTTP endpoint settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Diameter Rf settings (realm, peers, timeouts)
    pub billing: BillingConfig,

    /// Session store replication settings
    pub stores: StoresConfig,

    /// Interim timer service settings
    pub timer: TimerConfig,

    /// Load monitor (token bucket) settings
    #[serde(default)]
    pub load: LoadConfig,

    /// Telemetry configuration (logging, metrics)
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Billing HTTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bind address for the billing API
    #[serde(default = "default_http_bind")]
    pub bind: SocketAddr,

    /// Include request bodies in ACR trace logs
    #[serde(default)]
    pub acr_logging: bool,

    /// Graceful shutdown drain timeout
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            acr_logging: false,
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_http_bind() -> SocketAddr {
    "0.0.0.0:10888".parse().unwrap()
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Diameter Rf configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Destination-Realm set on every ACR
    pub realm: String,

    /// Fallback peer used when the session supplies no usable CCF list
    #[serde(default)]
    pub peer: Option<String>,

    /// Origin-Host identity of this gateway
    pub origin_host: String,

    /// Origin-Realm identity of this gateway
    pub origin_realm: String,

    /// Upper bound on concurrently connected Diameter peers
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Per-ACR timeout in milliseconds; derived from the latency target
    /// when unset
    #[serde(default)]
    pub diameter_timeout_ms: Option<u64>,

    /// How long a failing peer stays blacklisted
    #[serde(default = "default_blacklist", with = "humantime_serde")]
    pub blacklist_duration: Duration,
}

impl BillingConfig {
    /// Effective per-ACR timeout. Falls back to the load-monitor latency
    /// target (floored at 200ms) when not set explicitly.
    pub fn diameter_timeout(&self, target_latency_us: u64) -> Duration {
        match self.diameter_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis((target_latency_us / 1000).max(200)),
        }
    }
}

fn default_max_peers() -> usize {
    2
}

fn default_blacklist() -> Duration {
    Duration::from_secs(30)
}

/// One site's session store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteStore {
    /// Site name
    pub site: String,

    /// Store domain (memcached endpoint)
    pub domain: String,
}

/// Session store replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    /// All site stores, in declaration order. The entry matching
    /// `local_site_name` becomes the local store; the rest are remotes.
    pub session_stores: Vec<SiteStore>,

    /// Which site this node belongs to
    pub local_site_name: String,

    /// How long a failing store connection stays blacklisted
    #[serde(default = "default_blacklist", with = "humantime_serde")]
    pub blacklist_duration: Duration,

    /// Use the in-process memory backend instead of memcached (dev/test)
    #[serde(default)]
    pub in_memory: bool,
}

impl StoresConfig {
    /// Split the configured stores into (local, remotes), preserving
    /// declaration order for the remotes.
    pub fn split_local(&self) -> Option<(&SiteStore, Vec<&SiteStore>)> {
        let local = self
            .session_stores
            .iter()
            .find(|s| s.site == self.local_site_name)?;
        let remotes = self
            .session_stores
            .iter()
            .filter(|s| s.site != self.local_site_name)
            .collect();
        Some((local, remotes))
    }

    /// Parse the `site=domain[,site=domain...]` command-line form.
    pub fn parse_store_arg(arg: &str) -> Option<Vec<SiteStore>> {
        let mut stores = Vec::new();
        for part in arg.split(',') {
            let (site, domain) = part.split_once('=')?;
            if site.is_empty() || domain.is_empty() {
                return None;
            }
            stores.push(SiteStore {
                site: site.to_string(),
                domain: domain.to_string(),
            });
        }
        Some(stores)
    }
}

/// Timer service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Timer service base URL, e.g. `http://timers.example.com:7253`
    pub service_url: String,

    /// Hostname the timer service should call back on (this cluster's
    /// billing API address)
    pub callback_host: String,

    /// Timer request timeout
    #[serde(default = "default_timer_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_timer_timeout() -> Duration {
    Duration::from_millis(500)
}

/// Load monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Target request latency in microseconds
    #[serde(default = "default_target_latency_us")]
    pub target_latency_us: u64,

    /// Token bucket capacity
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Initial token fill rate (tokens/s)
    #[serde(default = "default_init_token_rate")]
    pub init_token_rate: f64,

    /// Lower bound on the adapted token rate
    #[serde(default = "default_min_token_rate")]
    pub min_token_rate: f64,

    /// Upper bound on the adapted token rate (0 = unbounded)
    #[serde(default)]
    pub max_token_rate: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            target_latency_us: default_target_latency_us(),
            max_tokens: default_max_tokens(),
            init_token_rate: default_init_token_rate(),
            min_token_rate: default_min_token_rate(),
            max_token_rate: 0.0,
        }
    }
}

fn default_target_latency_us() -> u64 {
    100_000
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_init_token_rate() -> f64 {
    100.0
}

fn default_min_token_rate() -> f64 {
    10.0
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON-formatted logs
    #[serde(default)]
    pub json_logs: bool,

    /// Bind address for the Prometheus metrics endpoint (disabled when
    /// unset)
    #[serde(default)]
    pub metrics_bind: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            metrics_bind: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
