//! Per-key request rate limiting.
//!
//! Two local algorithms (token bucket for bursty traffic, sliding window for
//! precision) plus a Redis-backed sliding window for multi-instance
//! deployments. Keys are derived per route policy from the client IP, the
//! `X-User-ID` header, or the `X-API-Key` header.
//!
//! The distributed limiter FAILS OPEN by design: if Redis is unreachable or
//! slower than its 50 ms budget, the request is admitted. A limiter that
//! turns a backing-store outage into a gateway outage would be strictly
//! worse than briefly admitting extra traffic.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use eyre::{Result, WrapErr};
use http::HeaderMap;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::{RateLimitAlgorithm, RateLimitConfig, RateLimitKey};

/// Returned when a key has exhausted its quota.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("rate limit exceeded; retry after {retry_after:?}")]
pub struct RateLimited {
    pub retry_after: Duration,
}

/// Budget for one round-trip to the distributed store.
const STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Derive the limiter key for a request.
///
/// `ip` keys prefer the full `X-Forwarded-For` value so every hop behind the
/// same proxy chain shares a bucket; otherwise the peer address is used.
pub fn derive_key(key_by: RateLimitKey, headers: &HeaderMap, peer_addr: &str) -> String {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    };
    match key_by {
        RateLimitKey::Ip => match header_str("x-forwarded-for") {
            Some(xff) => format!("ip:{xff}"),
            None => format!("ip:{peer_addr}"),
        },
        RateLimitKey::User => format!("user:{}", header_str("x-user-id").unwrap_or("anonymous")),
        RateLimitKey::ApiKey => {
            format!("apikey:{}", header_str("x-api-key").unwrap_or("anonymous"))
        }
    }
}

/// A route's rate limiter. `Disabled` admits everything.
pub enum RateLimiter {
    Disabled,
    TokenBucket(LocalTokenBucket),
    SlidingWindow(LocalSlidingWindow),
    Distributed(RedisSlidingWindow),
}

impl RateLimiter {
    /// Build the appropriate limiter from an optional route config.
    pub fn from_config(cfg: Option<&RateLimitConfig>) -> Result<Self> {
        let Some(cfg) = cfg else {
            return Ok(Self::Disabled);
        };

        if cfg.redis_url.is_some() {
            return Ok(Self::Distributed(RedisSlidingWindow::new(cfg)?));
        }

        match cfg.algorithm {
            RateLimitAlgorithm::SlidingWindow => {
                let window = parse_window(cfg)?;
                Ok(Self::SlidingWindow(LocalSlidingWindow::new(
                    cfg.rate as usize,
                    window,
                    cfg.key_by,
                )))
            }
            RateLimitAlgorithm::TokenBucket => Ok(Self::TokenBucket(LocalTokenBucket::new(
                cfg.rate as f64,
                cfg.burst as f64,
                cfg.key_by,
            ))),
        }
    }

    /// Admit or deny the request identified by `headers` + `peer_addr`.
    pub async fn allow(&self, headers: &HeaderMap, peer_addr: &str) -> Result<(), RateLimited> {
        match self {
            Self::Disabled => Ok(()),
            Self::TokenBucket(l) => l.allow(&derive_key(l.key_by, headers, peer_addr)),
            Self::SlidingWindow(l) => l.allow(&derive_key(l.key_by, headers, peer_addr)),
            Self::Distributed(l) => l.allow(&derive_key(l.key_by, headers, peer_addr)).await,
        }
    }
}

fn parse_window(cfg: &RateLimitConfig) -> Result<Duration> {
    let window = cfg.window.as_deref().unwrap_or("1s");
    humantime::parse_duration(window)
        .wrap_err_with(|| format!("invalid rate limit window '{window}'"))
}

// ---------------------------------------------------------------------------
// Local token bucket
// ---------------------------------------------------------------------------

struct TbBucket {
    tokens: f64,
    last_fill: Instant,
}

/// In-process token bucket, one bucket per key.
///
/// The bucket map takes a read lock on the hot path and upgrades to a write
/// lock only on first sight of a key (double-checked), so distinct keys
/// never contend.
pub struct LocalTokenBucket {
    rate: f64,
    burst: f64,
    key_by: RateLimitKey,
    buckets: RwLock<HashMap<String, Arc<Mutex<TbBucket>>>>,
}

impl LocalTokenBucket {
    fn new(rate: f64, burst: f64, key_by: RateLimitKey) -> Self {
        Self {
            rate,
            burst,
            key_by,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn allow(&self, key: &str) -> Result<(), RateLimited> {
        let bucket = self.get_or_create(key);
        let mut b = bucket.lock().expect("bucket lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(b.last_fill).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
        b.last_fill = now;

        if b.tokens < 1.0 {
            return Err(RateLimited {
                retry_after: Duration::from_secs_f64((1.0 - b.tokens) / self.rate),
            });
        }
        b.tokens -= 1.0;
        Ok(())
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<TbBucket>> {
        if let Some(b) = self.buckets.read().expect("bucket map poisoned").get(key) {
            return b.clone();
        }
        let mut map = self.buckets.write().expect("bucket map poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TbBucket {
                    tokens: self.burst,
                    last_fill: Instant::now(),
                }))
            })
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Local sliding window
// ---------------------------------------------------------------------------

/// In-process sliding window, one timestamp queue per key.
pub struct LocalSlidingWindow {
    rate: usize,
    window: Duration,
    key_by: RateLimitKey,
    buckets: RwLock<HashMap<String, Arc<Mutex<VecDeque<Instant>>>>>,
}

impl LocalSlidingWindow {
    fn new(rate: usize, window: Duration, key_by: RateLimitKey) -> Self {
        Self {
            rate,
            window,
            key_by,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn allow(&self, key: &str) -> Result<(), RateLimited> {
        let bucket = self.get_or_create(key);
        let mut timestamps = bucket.lock().expect("bucket lock poisoned");

        let now = Instant::now();
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.rate {
            let oldest = *timestamps.front().expect("window is non-empty when full");
            let retry_after = (oldest + self.window).saturating_duration_since(now);
            return Err(RateLimited { retry_after });
        }
        timestamps.push_back(now);
        Ok(())
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<VecDeque<Instant>>> {
        if let Some(b) = self.buckets.read().expect("bucket map poisoned").get(key) {
            return b.clone();
        }
        let mut map = self.buckets.write().expect("bucket map poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Distributed sliding window over Redis
// ---------------------------------------------------------------------------

// Sorted set per key; the script prunes, counts, and admits atomically so
// concurrent gateway instances cannot over-admit.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key    = KEYS[1]
local now    = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit  = tonumber(ARGV[3])
local cutoff = now - window

redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff)
local count = redis.call('ZCARD', key)
if count >= limit then
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  return {0, oldest[2]}
end
redis.call('ZADD', key, now, now)
redis.call('EXPIRE', key, math.ceil(window/1000))
return {1, 0}
"#;

/// Sliding window enforced through a Redis sorted set.
pub struct RedisSlidingWindow {
    client: redis::Client,
    script: redis::Script,
    conn: OnceCell<ConnectionManager>,
    rate: i64,
    window: Duration,
    key_by: RateLimitKey,
}

impl RedisSlidingWindow {
    fn new(cfg: &RateLimitConfig) -> Result<Self> {
        let url = cfg.redis_url.as_deref().unwrap_or_default();
        let client = redis::Client::open(url)
            .wrap_err_with(|| format!("invalid redis url '{url}'"))?;
        Ok(Self {
            client,
            script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
            conn: OnceCell::new(),
            rate: cfg.rate as i64,
            window: parse_window(cfg)?,
            key_by: cfg.key_by,
        })
    }

    async fn allow(&self, key: &str) -> Result<(), RateLimited> {
        let store_key = format!("rl:{key}");
        let now_ms = unix_millis();
        let window_ms = self.window.as_millis() as i64;

        let check = async {
            let conn = self
                .conn
                .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
                .await?;
            let mut conn = conn.clone();
            let verdict: Vec<i64> = self
                .script
                .key(&store_key)
                .arg(now_ms)
                .arg(window_ms)
                .arg(self.rate)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, redis::RedisError>(verdict)
        };

        match tokio::time::timeout(STORE_TIMEOUT, check).await {
            Ok(Ok(verdict)) if verdict.first() == Some(&0) => {
                let oldest_ms = verdict.get(1).copied().unwrap_or(now_ms);
                let retry_ms = (oldest_ms + window_ms - now_ms).max(0) as u64;
                Err(RateLimited {
                    retry_after: Duration::from_millis(retry_ms),
                })
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "rate limit store error; failing open");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("rate limit store timed out; failing open");
                Ok(())
            }
        }
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
