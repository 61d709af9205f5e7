//! Per-client token bucket admission control.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{RateLimitConfig, valid_rate};
use crate::{Error, Result, worker::Manager, worker::run_interval};

/// Delay suggested to a rejected client.
pub const RETRY_AFTER: Duration = Duration::from_secs(1);

/// Identity a bucket is keyed by. Authenticated users win over network addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    User(String),
    Ip(String),
}

impl ClientKey {
    /// Resolve the key for a request.
    ///
    /// `header` looks up a request header by name. The address comes from the first
    /// `X-Forwarded-For` hop, then `X-Real-IP`, then the socket's remote address.
    pub fn resolve<'a>(
        user_id: Option<&str>,
        header: impl Fn(&str) -> Option<&'a str>,
        remote_addr: &str,
    ) -> Self {
        if let Some(id) = user_id.filter(|id| !id.is_empty()) {
            return ClientKey::User(id.to_string());
        }
        let forwarded = header("X-Forwarded-For")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let ip = forwarded
            .or_else(|| header("X-Real-IP").map(str::trim).filter(|v| !v.is_empty()))
            .unwrap_or(remote_addr);
        ClientKey::Ip(ip.to_string())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKey::User(id) => write!(f, "user:{id}"),
            ClientKey::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket per client key.
///
/// Buckets start full at `burst` and refill lazily on each request at
/// `requests_per_second`, never above `burst`. A request is admitted when at
/// least one whole token is available.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(mut config: RateLimitConfig) -> Self {
        if !valid_rate(config.requests_per_second) {
            let fallback = RateLimitConfig::default().requests_per_second;
            warn!(
                requests_per_second = config.requests_per_second,
                fallback, "invalid refill rate, using default"
            );
            config.requests_per_second = fallback;
        }
        RateLimiter {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn allow(&self, key: &str) -> bool {
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.last_update = now;

        let capacity = f64::from(self.config.burst);
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.requests_per_second).clamp(0.0, capacity);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Like [`allow`](Self::allow) but reports a denial as [`Error::RateLimited`].
    pub fn check(&self, key: &str) -> Result<()> {
        if self.allow(key) {
            Ok(())
        } else {
            debug!(key, "request rate limited");
            Err(Error::RateLimited {
                key: key.to_string(),
                retry_after: RETRY_AFTER,
            })
        }
    }

    /// Drop buckets idle for longer than twice the cleanup interval.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.cleanup_interval * 2;
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.lock().last_update) <= idle);
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the periodic sweep with `manager`. It ends when the manager stops.
    pub fn spawn_sweeper(self: &Arc<Self>, manager: &Manager) {
        let limiter = self.clone();
        let period = self.config.cleanup_interval;
        manager.go("ratelimit-sweeper", move |token| async move {
            run_interval(&token, period, || {
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(count = removed, "removed idle rate limit buckets");
                }
                std::future::ready(())
            })
            .await;
        });
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return bucket.clone();
        }
        let mut buckets = self.buckets.write();
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: f64::from(self.config.burst),
                    last_update: Instant::now(),
                }))
            })
            .clone()
    }
}

/// A default limiter plus overrides keyed by request path.
pub struct EndpointLimiter {
    default: Arc<RateLimiter>,
    endpoints: HashMap<String, Arc<RateLimiter>>,
}

impl EndpointLimiter {
    pub fn new(default: RateLimitConfig) -> Self {
        EndpointLimiter {
            default: Arc::new(RateLimiter::new(default)),
            endpoints: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, path: impl Into<String>, config: RateLimitConfig) -> Self {
        self.endpoints
            .insert(path.into(), Arc::new(RateLimiter::new(config)));
        self
    }

    pub fn limiter_for(&self, path: &str) -> &Arc<RateLimiter> {
        self.endpoints.get(path).unwrap_or(&self.default)
    }

    pub fn check(&self, path: &str, key: &ClientKey) -> Result<()> {
        self.limiter_for(path).check(&key.to_string())
    }

    /// Register a sweeper for every limiter.
    pub fn spawn_sweepers(&self, manager: &Manager) {
        self.default.spawn_sweeper(manager);
        for limiter in self.endpoints.values() {
            limiter.spawn_sweeper(manager);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::default()
                .with_requests_per_second(rps)
                .with_burst(burst),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_then_deny_then_refill_one() {
        let rl = limiter(2.0, 5);
        for _ in 0..5 {
            assert!(rl.allow("ip:1.1.1.1"));
        }
        assert!(!rl.allow("ip:1.1.1.1"));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(rl.allow("ip:1.1.1.1"));
        assert!(!rl.allow("ip:1.1.1.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_capacity() {
        let rl = limiter(10.0, 3);
        assert!(rl.allow("k"));
        tokio::time::advance(Duration::from_secs(3600)).await;
        for _ in 0..3 {
            assert!(rl.allow("k"));
        }
        assert!(!rl.allow("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_rate_never_locks_out_or_admits_all() {
        let negative = RateLimiter::new(RateLimitConfig {
            requests_per_second: -5.0,
            burst: 1,
            ..RateLimitConfig::default()
        });
        assert!(negative.allow("k"));
        assert!(!negative.allow("k"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(negative.allow("k"));

        let nan = RateLimiter::new(RateLimitConfig {
            requests_per_second: f64::NAN,
            burst: 2,
            ..RateLimitConfig::default()
        });
        let admitted = (0..1000).filter(|_| nan.allow("k")).count();
        assert_eq!(admitted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let rl = limiter(1.0, 1);
        assert!(rl.allow("user:a"));
        assert!(!rl.allow("user:a"));
        assert!(rl.allow("user:b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reports_rate_limited() {
        let rl = limiter(1.0, 1);
        rl.check("ip:x").unwrap();
        match rl.check("ip:x") {
            Err(Error::RateLimited { key, retry_after }) => {
                assert_eq!(key, "ip:x");
                assert_eq!(retry_after, RETRY_AFTER);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_buckets() {
        let rl = RateLimiter::new(
            RateLimitConfig::default().with_cleanup_interval(Duration::from_secs(60)),
        );
        rl.allow("old");
        tokio::time::advance(Duration::from_secs(100)).await;
        rl.allow("fresh");
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(rl.sweep(), 1);
        assert_eq!(rl.len(), 1);
        assert!(rl.buckets.read().contains_key("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_under_manager() {
        let manager = Manager::new();
        let rl = Arc::new(RateLimiter::new(
            RateLimitConfig::default().with_cleanup_interval(Duration::from_secs(10)),
        ));
        rl.spawn_sweeper(&manager);
        rl.allow("idle");

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(rl.is_empty());
        manager.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn test_client_key_resolution() {
        let headers = |name: &str| match name {
            "X-Forwarded-For" => Some("203.0.113.7, 10.0.0.1"),
            "X-Real-IP" => Some("198.51.100.2"),
            _ => None,
        };
        assert_eq!(
            ClientKey::resolve(Some("u-1"), headers, "127.0.0.1:5000").to_string(),
            "user:u-1"
        );
        assert_eq!(
            ClientKey::resolve(None, headers, "127.0.0.1:5000").to_string(),
            "ip:203.0.113.7"
        );
        let real_ip = |name: &str| (name == "X-Real-IP").then_some("198.51.100.2");
        assert_eq!(
            ClientKey::resolve(Some(""), real_ip, "127.0.0.1:5000").to_string(),
            "ip:198.51.100.2"
        );
        assert_eq!(
            ClientKey::resolve(None, |_| None, "127.0.0.1:5000"),
            ClientKey::Ip("127.0.0.1:5000".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_overrides() {
        let limits = EndpointLimiter::new(RateLimitConfig::default().with_burst(5))
            .with_endpoint("/api/v1/aircraft/cluster", RateLimitConfig::default().with_burst(1));
        let key = ClientKey::Ip("1.2.3.4".into());

        limits.check("/api/v1/aircraft/cluster", &key).unwrap();
        assert!(limits.check("/api/v1/aircraft/cluster", &key).is_err());
        for _ in 0..5 {
            limits.check("/api/v1/chases", &key).unwrap();
        }
        assert_eq!(limits.limiter_for("/other").config().burst, 5);
    }
}
