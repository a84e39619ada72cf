//! Route table construction and longest-prefix matching.
//!
//! A [`RouteTable`] is immutable once built; reconfiguration builds a whole
//! new table and swaps it in atomically. Backends and breakers are identified
//! by `(route_prefix, backend_url)` across builds: a rebuilt route reuses the
//! existing records for URLs it keeps, so health state, in-flight counts and
//! breaker state survive reloads. Losing that identity would reset every
//! circuit and invite traffic storms after each config edit.
use std::{collections::HashMap, sync::Arc, time::Duration};

use eyre::Result;

use crate::{
    adapters::health_checker::HealthChecker,
    config::{LbAlgorithm, RouteConfig},
    core::{
        balancer::{self, Balancer},
        breaker::Breaker,
        rate_limit::RateLimiter,
    },
    ports::http_client::HttpClient,
};

/// One configured route: a path prefix bound to a balancer, an optional
/// rate limiter, optional per-backend breakers, and its health-checker task.
pub struct Route {
    prefix: String,
    strip_prefix: bool,
    timeout: Duration,
    lb_algorithm: LbAlgorithm,
    balancer: Arc<dyn Balancer>,
    limiter: RateLimiter,
    breakers: HashMap<String, Arc<Breaker>>,
    checker: Arc<HealthChecker>,
}

impl Route {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn strip_prefix(&self) -> bool {
        self.strip_prefix
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn balancer(&self) -> &Arc<dyn Balancer> {
        &self.balancer
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The breaker gating `url`, if circuit breaking is configured.
    pub fn breaker_for(&self, url: &str) -> Option<&Arc<Breaker>> {
        self.breakers.get(url)
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }
}

/// Ordered set of routes; replaced wholesale on reload.
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Build a table from validated route configs.
    ///
    /// When `old` is given (a reload), routes whose prefix already exists
    /// reuse their backend records, breakers, and health-checker task; the
    /// checker is pointed at the new backend set without a restart. Brand-new
    /// prefixes get fresh state. Stopping checkers of *removed* prefixes is
    /// the caller's job, after the new table is installed.
    pub fn build(
        cfgs: &[RouteConfig],
        old: Option<&RouteTable>,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        let mut routes = Vec::with_capacity(cfgs.len());
        for cfg in cfgs {
            let old_route = old.and_then(|t| {
                t.routes
                    .iter()
                    .find(|r| r.prefix == cfg.path_prefix)
                    .map(Arc::clone)
            });
            routes.push(Arc::new(Self::build_route(
                cfg,
                old_route.as_deref(),
                &http_client,
            )?));
        }
        Ok(Self { routes })
    }

    fn build_route(
        cfg: &RouteConfig,
        old: Option<&Route>,
        http_client: &Arc<dyn HttpClient>,
    ) -> Result<Route> {
        let balancer: Arc<dyn Balancer> = match old {
            // Same algorithm: keep the balancer, merge the backend list.
            Some(o) if o.lb_algorithm == cfg.lb_algorithm => {
                o.balancer.update(&cfg.backends)?;
                o.balancer.clone()
            }
            // Algorithm changed: new balancer around the surviving records.
            Some(o) => {
                let merged = balancer::merge_backends(&o.balancer.backends(), &cfg.backends)?;
                balancer::from_backends(cfg.lb_algorithm, merged)
            }
            None => balancer::build(cfg.lb_algorithm, &cfg.backends)?,
        };

        let limiter = RateLimiter::from_config(cfg.rate_limit.as_ref())?;

        let breakers = match &cfg.circuit_breaker {
            Some(cb_cfg) => balancer
                .backends()
                .iter()
                .map(|backend| {
                    let breaker = match old.and_then(|o| o.breakers.get(backend.url())) {
                        Some(existing) => {
                            existing.reconfigure(*cb_cfg);
                            existing.clone()
                        }
                        None => Arc::new(Breaker::new(*cb_cfg)),
                    };
                    (backend.url().to_string(), breaker)
                })
                .collect(),
            None => HashMap::new(),
        };

        let checker = match old {
            Some(o) => {
                o.checker.update(balancer.backends());
                o.checker.clone()
            }
            None => HealthChecker::spawn(balancer.backends(), http_client.clone()),
        };

        Ok(Route {
            prefix: cfg.path_prefix.clone(),
            strip_prefix: cfg.strip_prefix,
            timeout: cfg.timeout(),
            lb_algorithm: cfg.lb_algorithm,
            balancer,
            limiter,
            breakers,
            checker,
        })
    }

    /// Longest-prefix match; equal-length ties go to the earlier route.
    pub fn match_route(&self, path: &str) -> Option<&Arc<Route>> {
        let mut matched: Option<&Arc<Route>> = None;
        for route in &self.routes {
            if path.starts_with(&route.prefix) {
                match matched {
                    Some(m) if m.prefix.len() >= route.prefix.len() => {}
                    _ => matched = Some(route),
                }
            }
        }
        matched
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use http::StatusCode;
    use hyper::{Request, Response};

    use super::*;
    use crate::{
        config::{BackendConfig, CircuitBreakerConfig},
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    /// Probe-only client whose backends always report healthy.
    struct HealthyProbeClient;

    #[async_trait]
    impl HttpClient for HealthyProbeClient {
        async fn send_request(&self, _req: Request<Body>) -> HttpClientResult<Response<Body>> {
            Err(HttpClientError::ConnectionError("not used".to_string()))
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            Ok(StatusCode::OK)
        }
    }

    fn route_cfg(prefix: &str, urls: &[&str]) -> RouteConfig {
        RouteConfig {
            path_prefix: prefix.to_string(),
            backends: urls
                .iter()
                .map(|u| BackendConfig {
                    url: (*u).to_string(),
                    weight: 1,
                })
                .collect(),
            lb_algorithm: Default::default(),
            rate_limit: None,
            circuit_breaker: None,
            timeout_seconds: 30,
            strip_prefix: false,
        }
    }

    fn client() -> Arc<dyn HttpClient> {
        Arc::new(HealthyProbeClient)
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let table = RouteTable::build(
            &[
                route_cfg("/api", &["http://a:1"]),
                route_cfg("/api/users", &["http://b:1"]),
            ],
            None,
            client(),
        )
        .unwrap();

        assert_eq!(table.match_route("/api/users/7").unwrap().prefix(), "/api/users");
        assert_eq!(table.match_route("/api/orders").unwrap().prefix(), "/api");
        assert!(table.match_route("/other").is_none());
    }

    #[tokio::test]
    async fn equal_prefixes_tie_to_config_order() {
        let table = RouteTable::build(
            &[
                route_cfg("/api", &["http://first:1"]),
                route_cfg("/api", &["http://second:1"]),
            ],
            None,
            client(),
        )
        .unwrap();

        let matched = table.match_route("/api/x").unwrap();
        assert_eq!(matched.balancer().backends()[0].url(), "http://first:1");
    }

    #[tokio::test]
    async fn rebuild_preserves_backend_and_breaker_identity() {
        let mut cfg = route_cfg("/api", &["http://a:1", "http://b:1"]);
        cfg.circuit_breaker = Some(CircuitBreakerConfig {
            min_requests: 2,
            ..Default::default()
        });

        let table = RouteTable::build(&[cfg.clone()], None, client()).unwrap();
        let route = table.match_route("/api").unwrap();
        let a = route.balancer().backends()[0].clone();
        a.set_alive(false);
        let a_breaker = route.breaker_for("http://a:1").unwrap().clone();
        a_breaker.record_failure();
        a_breaker.record_failure();
        assert_eq!(a_breaker.state(), "open");

        // Reload: replace b with c, keep a.
        cfg.backends = vec![
            BackendConfig {
                url: "http://a:1".to_string(),
                weight: 1,
            },
            BackendConfig {
                url: "http://c:1".to_string(),
                weight: 1,
            },
        ];
        let table2 = RouteTable::build(&[cfg], Some(&table), client()).unwrap();
        let route2 = table2.match_route("/api").unwrap();

        let backends = route2.balancer().backends();
        assert!(Arc::ptr_eq(&backends[0], &a));
        assert!(!backends[0].is_alive());
        assert_eq!(backends[1].url(), "http://c:1");

        // a's breaker survived open; c starts closed.
        assert!(Arc::ptr_eq(route2.breaker_for("http://a:1").unwrap(), &a_breaker));
        assert_eq!(route2.breaker_for("http://a:1").unwrap().state(), "open");
        assert_eq!(route2.breaker_for("http://c:1").unwrap().state(), "closed");
        assert!(route2.breaker_for("http://b:1").is_none());
    }

    #[tokio::test]
    async fn rebuild_reuses_health_checker_for_surviving_prefix() {
        let cfg = route_cfg("/api", &["http://a:1"]);
        let table = RouteTable::build(&[cfg.clone()], None, client()).unwrap();
        let checker = table.match_route("/api").unwrap().checker().clone();

        let table2 = RouteTable::build(&[cfg], Some(&table), client()).unwrap();
        assert!(Arc::ptr_eq(table2.match_route("/api").unwrap().checker(), &checker));
    }
}
