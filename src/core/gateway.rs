//! Request dispatch and live reconfiguration.
//!
//! [`GatewayService`] owns the route table and orchestrates one request:
//! match → rate limit → pick backend → breaker admit → forward → observe.
//! The table lives behind an `ArcSwap`, so every request works against
//! exactly one snapshot start to end while the reloader installs a new table
//! with a single pointer swap.
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use axum::body::Body;
use eyre::Result;
use http::{StatusCode, header, header::HeaderValue};
use hyper::{Request, Response};
use serde::Serialize;

use crate::{
    config::Config,
    core::{
        breaker::Breaker,
        route::{Route, RouteTable},
    },
    metrics,
    ports::http_client::HttpClient,
};

/// Admin-surface view of one backend.
#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub alive: bool,
    pub inflight: i64,
    pub circuit_breaker: &'static str,
}

/// Admin-surface view of one route.
#[derive(Debug, Serialize)]
pub struct RouteStatus {
    pub route: String,
    pub backends: Vec<BackendStatus>,
}

/// The data plane: one instance per process, shared by every connection.
pub struct GatewayService {
    table: ArcSwap<RouteTable>,
    http_client: Arc<dyn HttpClient>,
}

impl GatewayService {
    /// Build the initial route table. Fails (and the process should abort)
    /// if any route cannot be constructed.
    pub fn new(cfg: &Config, http_client: Arc<dyn HttpClient>) -> Result<Self> {
        let table = RouteTable::build(&cfg.routes, None, http_client.clone())?;
        Ok(Self {
            table: ArcSwap::new(Arc::new(table)),
            http_client,
        })
    }

    /// Swap in routes built from a new config, preserving backend and
    /// breaker identity for unchanged `(prefix, url)` pairs. On error the
    /// current table keeps serving. In-flight requests finish against the
    /// snapshot they started with.
    pub fn reload(&self, cfg: &Config) -> Result<()> {
        let old = self.table.load_full();
        let new = Arc::new(RouteTable::build(
            &cfg.routes,
            Some(&old),
            self.http_client.clone(),
        )?);
        self.table.store(new.clone());

        // Health checkers follow their route's prefix: reused ones were
        // already repointed by the build, orphaned ones stop here.
        for old_route in old.routes() {
            if !new.routes().iter().any(|r| r.prefix() == old_route.prefix()) {
                old_route.checker().stop();
            }
        }

        tracing::info!(routes = new.routes().len(), "route table replaced");
        Ok(())
    }

    /// Handle one inbound request end to end.
    pub async fn dispatch(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let table = self.table.load_full();

        let path = req.uri().path().to_string();
        let Some(route) = table.match_route(&path) else {
            return text_response(StatusCode::NOT_FOUND, "no route matched");
        };

        let method = req.method().as_str().to_string();
        let start = Instant::now();
        let response = self.dispatch_route(route.as_ref(), req, peer).await;
        metrics::observe_request(
            route.prefix(),
            &method,
            response.status().as_u16(),
            start.elapsed(),
        );
        response
    }

    async fn dispatch_route(
        &self,
        route: &Route,
        req: Request<Body>,
        peer: SocketAddr,
    ) -> Response<Body> {
        let peer_str = peer.to_string();

        if let Err(limited) = route.limiter().allow(req.headers(), &peer_str).await {
            return rate_limited_response(limited.retry_after);
        }

        let client_ip = balancing_ip(req.headers(), &peer_str);
        let Ok(backend) = route.balancer().next(&client_ip) else {
            tracing::error!(route = route.prefix(), "no healthy backend");
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "service unavailable - no healthy backends",
            );
        };

        let breaker = route.breaker_for(backend.url());
        if let Some(cb) = breaker {
            if cb.allow().is_err() {
                return text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service unavailable - circuit open",
                );
            }
        }

        let _inflight = backend.start_request();

        let outbound = match build_outbound(req, route, backend.url(), peer) {
            Ok(outbound) => outbound,
            Err(err) => {
                tracing::error!(error = %err, backend = backend.url(), "failed to build outbound request");
                // Nothing reached the wire; no breaker observation.
                return text_response(StatusCode::BAD_GATEWAY, "bad gateway");
            }
        };

        // From here on exactly one outcome is recorded, even if the caller
        // disconnects and this future is dropped mid-forward.
        let outcome_guard = BreakerOutcome::new(breaker);

        let outcome = tokio::time::timeout(
            route.timeout(),
            self.http_client.send_request(outbound),
        )
        .await;

        match outcome {
            Ok(Ok(mut response)) => {
                if response.status().as_u16() >= 500 {
                    // A 5xx counts against the breaker and sidelines the
                    // backend until the health checker clears it; the
                    // response body itself is forwarded unchanged.
                    outcome_guard.failure();
                    backend.set_alive(false);
                } else {
                    outcome_guard.success();
                    backend.set_alive(true);
                }
                if let Ok(value) = HeaderValue::from_str(backend.url()) {
                    response.headers_mut().insert("x-gateway-backend", value);
                }
                response
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, backend = backend.url(), "upstream error");
                outcome_guard.failure();
                backend.set_alive(false);
                text_response(StatusCode::BAD_GATEWAY, "bad gateway")
            }
            Err(_elapsed) => {
                tracing::error!(
                    backend = backend.url(),
                    timeout = ?route.timeout(),
                    "upstream timed out"
                );
                outcome_guard.failure();
                backend.set_alive(false);
                text_response(StatusCode::BAD_GATEWAY, "bad gateway")
            }
        }
    }

    /// The current route-table snapshot.
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// True when at least one route has at least one alive backend.
    pub fn is_ready(&self) -> bool {
        self.table
            .load()
            .routes()
            .iter()
            .any(|route| route.balancer().backends().iter().any(|b| b.is_alive()))
    }

    /// Per-route backend state for the admin surface.
    pub fn backend_report(&self) -> Vec<RouteStatus> {
        self.table
            .load()
            .routes()
            .iter()
            .map(|route| RouteStatus {
                route: route.prefix().to_string(),
                backends: route
                    .balancer()
                    .backends()
                    .iter()
                    .map(|b| BackendStatus {
                        url: b.url().to_string(),
                        alive: b.is_alive(),
                        inflight: b.inflight(),
                        circuit_breaker: route
                            .breaker_for(b.url())
                            .map(|cb| cb.state())
                            .unwrap_or("disabled"),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Ensures exactly one breaker observation per forwarded request.
///
/// If the dispatch future is dropped while the upstream call is in flight
/// (the caller disconnected), the drop records a failure rather than
/// nothing; a cancelled request must never look like a success.
struct BreakerOutcome {
    breaker: Option<Arc<Breaker>>,
}

impl BreakerOutcome {
    fn new(breaker: Option<&Arc<Breaker>>) -> Self {
        Self {
            breaker: breaker.cloned(),
        }
    }

    fn success(mut self) {
        if let Some(cb) = self.breaker.take() {
            cb.record_success();
        }
    }

    fn failure(mut self) {
        if let Some(cb) = self.breaker.take() {
            cb.record_failure();
        }
    }
}

impl Drop for BreakerOutcome {
    fn drop(&mut self) {
        if let Some(cb) = self.breaker.take() {
            cb.record_failure();
        }
    }
}

/// Client IP used for ip_hash stickiness: prefer `X-Forwarded-For`, then
/// `X-Real-IP`, then the peer address.
fn balancing_ip(headers: &http::HeaderMap, peer: &str) -> String {
    for name in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    peer.to_string()
}

/// Rewrite one inbound request for its selected backend: retarget the URI,
/// strip the route prefix when configured, and append forwarding headers.
fn build_outbound(
    mut req: Request<Body>,
    route: &Route,
    backend_url: &str,
    peer: SocketAddr,
) -> Result<Request<Body>> {
    let original_uri = req.uri().clone();
    let inbound_host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let path = original_uri.path();
    let mut forwarded_path = if route.strip_prefix() {
        match path.strip_prefix(route.prefix()) {
            Some("") | None => "/".to_string(),
            Some(rest) => rest.to_string(),
        }
    } else {
        path.to_string()
    };
    if !forwarded_path.starts_with('/') {
        forwarded_path.insert(0, '/');
    }

    let target = match original_uri.query() {
        Some(query) => format!("{backend_url}{forwarded_path}?{query}"),
        None => format!("{backend_url}{forwarded_path}"),
    };
    *req.uri_mut() = target.parse()?;

    let client_ip = peer.ip().to_string();
    let forwarded_for = match req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) if !prior.is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip,
    };
    req.headers_mut()
        .insert("x-forwarded-for", HeaderValue::from_str(&forwarded_for)?);
    if let Some(host) = inbound_host {
        if let Ok(value) = HeaderValue::from_str(&host) {
            req.headers_mut().insert("x-forwarded-host", value);
        }
    }
    req.headers_mut()
        .insert("x-forwarded-proto", HeaderValue::from_static("http"));

    Ok(req)
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from(body)))
}

fn rate_limited_response(retry_after: std::time::Duration) -> Response<Body> {
    let retry_secs = retry_after.as_secs_f64().round() as u64;
    let reset = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| now.as_secs() + retry_after.as_secs())
        .unwrap_or_default();

    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::RETRY_AFTER, retry_secs.to_string())
        .header("x-ratelimit-reset", reset.to_string())
        .body(Body::from("too many requests"))
        .unwrap_or_else(|_| {
            let mut resp = Response::new(Body::from("too many requests"));
            *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            resp
        })
}
