use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    },
};

use thiserror::Error;

/// Errors related to backend bookkeeping.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// The configured URL is not an absolute http(s) URL.
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// A single upstream server, identified by its absolute URL.
///
/// One `Backend` exists per `(route, url)` pair and survives config reloads
/// as long as the URL stays in the route's backend list, so the `alive` flag
/// and in-flight count are never reset by a reload.
///
/// `alive` is written by the health checker and the dispatcher's error path,
/// and read by every balancer; `inflight` is bumped around each forwarded
/// request. Both are atomics so request handlers never serialise on them.
#[derive(Debug)]
pub struct Backend {
    url: String,
    weight: AtomicU32,
    alive: AtomicBool,
    inflight: AtomicI64,
}

impl Backend {
    /// Create a backend. Starts alive with zero in-flight requests.
    pub fn new(url: &str, weight: u32) -> Result<Arc<Self>, BackendError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(BackendError::InvalidUrl(format!(
                "must start with http:// or https://, got: {url}"
            )));
        }
        Ok(Arc::new(Self {
            url: url.trim_end_matches('/').to_string(),
            weight: AtomicU32::new(weight.max(1)),
            alive: AtomicBool::new(true),
            inflight: AtomicI64::new(0),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Weight is only written by the reloader.
    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Increment the in-flight count, returning a guard that decrements it
    /// on every exit path.
    pub fn start_request(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            backend: self.clone(),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// RAII guard pairing every `inflight` increment with exactly one decrement.
pub struct InflightGuard {
    backend: Arc<Backend>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.backend.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}
