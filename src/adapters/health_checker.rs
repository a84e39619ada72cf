//! Active health checking of upstream backends.
//!
//! One checker task runs per route. Every tick it probes each backend's
//! `/health` endpoint concurrently and flips the backend's `alive` flag,
//! which the balancers read on the next pick. The dispatcher is never
//! blocked by probe I/O.
use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::{core::backend::Backend, ports::http_client::HttpClient};

const CHECK_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const HEALTH_PATH: &str = "/health";

/// Periodic out-of-band prober for one route's backend set.
pub struct HealthChecker {
    backends: RwLock<Vec<Arc<Backend>>>,
    http_client: Arc<dyn HttpClient>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    /// Create the checker and start its task. The first probe pass runs
    /// immediately, then every ten seconds.
    pub fn spawn(backends: Vec<Arc<Backend>>, http_client: Arc<dyn HttpClient>) -> Arc<Self> {
        let checker = Arc::new(Self {
            backends: RwLock::new(backends),
            http_client,
            handle: Mutex::new(None),
        });

        let task = checker.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                task.check_all().await;
            }
        });
        *checker.handle.lock().expect("checker handle poisoned") = Some(handle);

        checker
    }

    /// Swap the probed backend set without restarting the task; the next
    /// tick operates on the new set.
    pub fn update(&self, backends: Vec<Arc<Backend>>) {
        *self.backends.write().expect("checker backends poisoned") = backends;
    }

    /// Stop the background task. Called when the route's prefix disappears
    /// from the configuration.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().expect("checker handle poisoned").take() {
            handle.abort();
        }
    }

    /// Probe every backend concurrently.
    pub async fn check_all(&self) {
        let backends = self
            .backends
            .read()
            .expect("checker backends poisoned")
            .clone();
        join_all(backends.iter().map(|b| self.check_one(b))).await;
    }

    async fn check_one(&self, backend: &Arc<Backend>) {
        let url = format!("{}{HEALTH_PATH}", backend.url());
        let was_alive = backend.is_alive();

        let alive = match self.http_client.probe(&url, PROBE_TIMEOUT).await {
            Ok(status) => {
                let alive = status.as_u16() < 500;
                if !alive && was_alive {
                    tracing::warn!(url = backend.url(), status = status.as_u16(), "backend unhealthy");
                }
                if alive && !was_alive {
                    tracing::info!(url = backend.url(), status = status.as_u16(), "backend recovered");
                }
                alive
            }
            Err(err) => {
                if was_alive {
                    tracing::warn!(url = backend.url(), error = %err, "backend unhealthy");
                }
                false
            }
        };

        backend.set_alive(alive);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU16, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use http::StatusCode;
    use hyper::{Request, Response};

    use super::*;
    use crate::ports::http_client::{HttpClientError, HttpClientResult};

    /// Probe client returning a configurable status, or a transport error
    /// when the status is set to 0.
    struct ProbeClient {
        status: AtomicU16,
    }

    impl ProbeClient {
        fn new(status: u16) -> Arc<Self> {
            Arc::new(Self {
                status: AtomicU16::new(status),
            })
        }

        fn set_status(&self, status: u16) {
            self.status.store(status, Ordering::Relaxed);
        }
    }

    #[async_trait]
    impl HttpClient for ProbeClient {
        async fn send_request(&self, _req: Request<Body>) -> HttpClientResult<Response<Body>> {
            Err(HttpClientError::ConnectionError("not used".to_string()))
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            match self.status.load(Ordering::Relaxed) {
                0 => Err(HttpClientError::ConnectionError("refused".to_string())),
                s => Ok(StatusCode::from_u16(s).expect("valid status")),
            }
        }
    }

    fn backend(url: &str) -> Arc<Backend> {
        Backend::new(url, 1).unwrap()
    }

    #[tokio::test]
    async fn five_hundreds_mark_backend_dead() {
        let client = ProbeClient::new(500);
        let b = backend("http://a:1");
        let checker = HealthChecker::spawn(vec![b.clone()], client);
        checker.check_all().await;
        assert!(!b.is_alive());
        checker.stop();
    }

    #[tokio::test]
    async fn transport_errors_mark_backend_dead() {
        let client = ProbeClient::new(0);
        let b = backend("http://a:1");
        let checker = HealthChecker::spawn(vec![b.clone()], client);
        checker.check_all().await;
        assert!(!b.is_alive());
        checker.stop();
    }

    #[tokio::test]
    async fn non_5xx_statuses_count_as_alive() {
        // Even a 404 from /health means the process is up.
        let client = ProbeClient::new(404);
        let b = backend("http://a:1");
        b.set_alive(false);
        let checker = HealthChecker::spawn(vec![b.clone()], client);
        checker.check_all().await;
        assert!(b.is_alive());
        checker.stop();
    }

    #[tokio::test]
    async fn recovery_flips_backend_back() {
        let client = ProbeClient::new(503);
        let b = backend("http://a:1");
        let checker = HealthChecker::spawn(vec![b.clone()], client.clone());
        checker.check_all().await;
        assert!(!b.is_alive());

        client.set_status(200);
        checker.check_all().await;
        assert!(b.is_alive());
        checker.stop();
    }

    #[tokio::test]
    async fn update_swaps_probed_set() {
        let client = ProbeClient::new(500);
        let a = backend("http://a:1");
        let c = backend("http://c:1");
        let checker = HealthChecker::spawn(vec![a.clone()], client);

        checker.update(vec![c.clone()]);
        checker.check_all().await;
        // Only the new set is probed.
        assert!(a.is_alive());
        assert!(!c.is_alive());
        checker.stop();
    }
}
