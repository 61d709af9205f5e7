//! Runtime configuration.
//!
//! Every struct implements [`Default`] and offers `with_*` builders. `from_env()`
//! reads process environment variables and falls back to the default for any
//! variable that is absent or cannot be parsed.
//!
//! ```rust
//! use std::time::Duration;
//! use chaseapp_core::config::RateLimitConfig;
//!
//! let config = RateLimitConfig::default()
//!     .with_requests_per_second(5.0)
//!     .with_burst(10)
//!     .with_cleanup_interval(Duration::from_secs(30));
//! ```

use std::{str::FromStr, time::Duration};

use tracing::warn;

/// Source of configuration values, keyed by variable name.
pub(crate) trait Lookup {
    fn get(&self, key: &str) -> Option<String>;

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %raw, "ignoring unparseable configuration value");
                default
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl<F: Fn(&str) -> Option<String>> Lookup for F {
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

/// Broker connection and stream settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// Default: `nats://localhost:4222`
    pub url: String,
    /// Connection name prefix. Default: `api-server`
    pub client_id: String,
    /// Default: 10
    pub max_reconnects: usize,
    /// Default: 2 s
    pub reconnect_wait: Duration,
    /// How long a stream keeps messages. Default: 24 h
    pub max_age: Duration,
    /// Deliveries of one message before it is dropped. Default: 5
    pub max_deliver: u32,
    /// Time the broker waits for an ack before redelivering. Default: 30 s
    pub ack_wait: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            url: "nats://localhost:4222".into(),
            client_id: "api-server".into(),
            max_reconnects: 10,
            reconnect_wait: Duration::from_secs(2),
            max_age: Duration::from_secs(24 * 60 * 60),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&env)
    }

    pub(crate) fn from_lookup(env: &impl Lookup) -> Self {
        let d = Self::default();
        BusConfig {
            url: env.string("NATS_URL", &d.url),
            client_id: env.string("NATS_CLIENT_ID", &d.client_id),
            max_reconnects: env.parse("NATS_MAX_RECONNECTS", d.max_reconnects),
            reconnect_wait: env.secs("NATS_RECONNECT_WAIT_SECS", d.reconnect_wait),
            ..d
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set how many times a message is delivered before the broker gives up on it.
    /// Values below 1 are raised to 1.
    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver.max(1);
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

pub(crate) fn valid_rate(rps: f64) -> bool {
    rps.is_finite() && rps > 0.0
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Refill rate. Default: 10
    pub requests_per_second: f64,
    /// Bucket capacity; a new bucket starts full. Default: 20
    pub burst: u32,
    /// Sweep period. Buckets idle for twice this long are dropped. Default: 60 s
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            requests_per_second: 10.0,
            burst: 20,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&env)
    }

    pub(crate) fn from_lookup(env: &impl Lookup) -> Self {
        let d = Self::default();
        let mut rps = env.parse("RATE_LIMIT_RPS", d.requests_per_second);
        if !valid_rate(rps) {
            warn!(key = "RATE_LIMIT_RPS", value = rps, "refill rate must be positive");
            rps = d.requests_per_second;
        }
        RateLimitConfig {
            requests_per_second: rps,
            burst: env.parse("RATE_LIMIT_BURST", d.burst),
            ..d
        }
    }

    /// Set the refill rate. Non-positive or non-finite rates are ignored.
    pub fn with_requests_per_second(mut self, rps: f64) -> Self {
        if valid_rate(rps) {
            self.requests_per_second = rps;
        }
        self
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Periods of the timer-driven workers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Default: 5 min
    pub aircraft_sync_interval: Duration,
    /// Aircraft not seen for this long are pruned. Default: 15 min
    pub aircraft_ttl: Duration,
    /// Default: 20 min
    pub media_interval: Duration,
    /// Default: 15 min
    pub stats_interval: Duration,
    /// Default: 10 min
    pub weather_interval: Duration,
    /// Grace period for workers on shutdown. Default: 30 s
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            aircraft_sync_interval: Duration::from_secs(5 * 60),
            aircraft_ttl: Duration::from_secs(15 * 60),
            media_interval: Duration::from_secs(20 * 60),
            stats_interval: Duration::from_secs(15 * 60),
            weather_interval: Duration::from_secs(10 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&env)
    }

    pub(crate) fn from_lookup(env: &impl Lookup) -> Self {
        let d = Self::default();
        WorkerConfig {
            shutdown_timeout: env.secs("SERVER_SHUTDOWN_TIMEOUT_SECS", d.shutdown_timeout),
            ..d
        }
    }

    pub fn with_aircraft_sync(mut self, interval: Duration, ttl: Duration) -> Self {
        self.aircraft_sync_interval = interval;
        self.aircraft_ttl = ttl;
        self
    }

    pub fn with_media_interval(mut self, interval: Duration) -> Self {
        self.media_interval = interval;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_weather_interval(mut self, interval: Duration) -> Self {
        self.weather_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Typesense connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub api_key: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            host: "localhost".into(),
            port: 8108,
            protocol: "http".into(),
            api_key: String::new(),
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&env)
    }

    pub(crate) fn from_lookup(env: &impl Lookup) -> Self {
        let d = Self::default();
        SearchConfig {
            host: env.string("TYPESENSE_HOST", &d.host),
            port: env.parse("TYPESENSE_PORT", d.port),
            protocol: env.string("TYPESENSE_PROTOCOL", &d.protocol),
            api_key: env.string("TYPESENSE_API_KEY", ""),
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }
}

/// Third-party data feeds and the outbound webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub usgs_base_url: String,
    pub aishub_base_url: String,
    pub aishub_api_key: String,
    pub noaa_base_url: String,
    pub launch_library_base_url: String,
    pub discord_webhook_url: String,
    /// Default: 15 s
    pub timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            usgs_base_url: "https://earthquake.usgs.gov".into(),
            aishub_base_url: "https://data.aishub.net/ws.php".into(),
            aishub_api_key: String::new(),
            noaa_base_url: "https://api.weather.gov".into(),
            launch_library_base_url: "https://ll.thespacedevs.com/2.2.0".into(),
            discord_webhook_url: String::new(),
            timeout: Duration::from_secs(15),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&env)
    }

    pub(crate) fn from_lookup(env: &impl Lookup) -> Self {
        let d = Self::default();
        FeedConfig {
            usgs_base_url: env.string("USGS_BASE_URL", &d.usgs_base_url),
            aishub_base_url: env.string("AISHUB_BASE_URL", &d.aishub_base_url),
            aishub_api_key: env.string("AISHUB_API_KEY", ""),
            noaa_base_url: env.string("NOAA_BASE_URL", &d.noaa_base_url),
            launch_library_base_url: env
                .string("LAUNCH_LIBRARY_BASE_URL", &d.launch_library_base_url),
            discord_webhook_url: env.string("DISCORD_WEBHOOK_URL", ""),
            ..d
        }
    }

    /// Point every feed at one base URL. Used against mock servers.
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.usgs_base_url = base.to_string();
        self.aishub_base_url = format!("{base}/ws.php");
        self.noaa_base_url = base.to_string();
        self.launch_library_base_url = base.to_string();
        self
    }

    pub fn with_aishub_api_key(mut self, key: impl Into<String>) -> Self {
        self.aishub_api_key = key.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Everything the background layer needs at boot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub rate_limit: RateLimitConfig,
    pub workers: WorkerConfig,
    pub search: SearchConfig,
    pub feeds: FeedConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&env)
    }

    pub(crate) fn from_lookup(env: &impl Lookup) -> Self {
        AppConfig {
            bus: BusConfig::from_lookup(env),
            rate_limit: RateLimitConfig::from_lookup(env),
            workers: WorkerConfig::from_lookup(env),
            search: SearchConfig::from_lookup(env),
            feeds: FeedConfig::from_lookup(env),
        }
    }

    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }
}
