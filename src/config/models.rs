//! Configuration data structures.
//!
//! These types map directly to the YAML configuration file. They are
//! serde-friendly and carry defaults so minimal configs stay concise; the
//! same structs are fed to the reloader on every file change.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration: serving socket, admin socket, logging, routes.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            read_timeout_seconds: 30,
            write_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdminConfig {
    pub addr: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:9090".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `portcullis=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Console,
}

/// One routing rule: a path prefix bound to a backend pool with optional
/// rate limiting and circuit breaking.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub lb_algorithm: LbAlgorithm,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub strip_prefix: bool,
}

impl RouteConfig {
    /// Per-request timeout bounding the outbound dial and header wait.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LbAlgorithm {
    #[default]
    RoundRobin,
    LeastConn,
    Weighted,
    IpHash,
}

/// Per-route rate limit definition.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    /// Tokens per second (token bucket) or admits per window (sliding window).
    pub rate: u64,
    /// Bucket capacity; token bucket only.
    #[serde(default)]
    pub burst: u64,
    /// Window duration string, e.g. "1s" or "5m"; sliding window only.
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub key_by: RateLimitKey,
    /// When set, enforce the limit through Redis instead of process memory.
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    #[default]
    Ip,
    User,
    ApiKey,
}

/// Per-route circuit breaker parameters; one breaker is instantiated per
/// backend URL of the route.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0-100) that trips the breaker.
    pub failure_threshold: u32,
    /// Minimum observations in the rolling window before tripping.
    pub min_requests: usize,
    pub open_duration_seconds: u64,
    pub half_open_requests: u32,
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_seconds)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 50,
            min_requests: 20,
            open_duration_seconds: 30,
            half_open_requests: 5,
        }
    }
}
