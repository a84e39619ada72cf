//! Live reconfiguration: state preservation and failure containment.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body;
use http::StatusCode;
use hyper::{Request, Response};
use portcullis::{
    config::{
        BackendConfig, CircuitBreakerConfig, Config, LbAlgorithm, RouteConfig,
    },
    core::GatewayService,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

struct OkUpstream;

#[async_trait]
impl HttpClient for OkUpstream {
    async fn send_request(&self, _req: Request<Body>) -> HttpClientResult<Response<Body>> {
        Ok(Response::builder()
            .status(200)
            .body(Body::from("upstream"))
            .unwrap())
    }

    async fn probe(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
        Ok(StatusCode::OK)
    }
}

fn route(prefix: &str, urls: &[&str]) -> RouteConfig {
    RouteConfig {
        path_prefix: prefix.to_string(),
        backends: urls
            .iter()
            .map(|u| BackendConfig {
                url: (*u).to_string(),
                weight: 1,
            })
            .collect(),
        lb_algorithm: LbAlgorithm::RoundRobin,
        rate_limit: None,
        circuit_breaker: None,
        timeout_seconds: 30,
        strip_prefix: false,
    }
}

fn config(routes: Vec<RouteConfig>) -> Config {
    Config {
        routes,
        ..Default::default()
    }
}

fn quiesce(gw: &GatewayService) {
    for r in gw.table().routes() {
        r.checker().stop();
    }
}

fn peer() -> SocketAddr {
    "10.1.1.1:55555".parse().unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn reload_swaps_backend_set_and_preserves_survivors() {
    let mut cfg_route = route("/api", &["http://a:1", "http://b:1"]);
    cfg_route.circuit_breaker = Some(CircuitBreakerConfig {
        min_requests: 2,
        open_duration_seconds: 60,
        ..Default::default()
    });
    let gw = GatewayService::new(&config(vec![cfg_route.clone()]), Arc::new(OkUpstream)).unwrap();
    quiesce(&gw);

    // Accumulate observable state on `a`.
    let table = gw.table();
    let a = table.match_route("/api").unwrap().balancer().backends()[0].clone();
    a.set_alive(false);
    let a_breaker = table
        .match_route("/api")
        .unwrap()
        .breaker_for("http://a:1")
        .unwrap()
        .clone();
    a_breaker.record_failure();
    a_breaker.record_failure();
    assert_eq!(a_breaker.state(), "open");
    drop(table);

    // Replace [a, b] with [a, c].
    cfg_route.backends = vec![
        BackendConfig {
            url: "http://a:1".to_string(),
            weight: 1,
        },
        BackendConfig {
            url: "http://c:1".to_string(),
            weight: 1,
        },
    ];
    gw.reload(&config(vec![cfg_route])).unwrap();
    quiesce(&gw);

    let table = gw.table();
    let route = table.match_route("/api").unwrap();
    let backends = route.balancer().backends();
    assert_eq!(backends.len(), 2);
    assert!(Arc::ptr_eq(&backends[0], &a), "a's record must survive");
    assert!(!backends[0].is_alive(), "a's health state must survive");
    assert_eq!(backends[1].url(), "http://c:1");

    assert!(Arc::ptr_eq(
        route.breaker_for("http://a:1").unwrap(),
        &a_breaker
    ));
    assert_eq!(route.breaker_for("http://a:1").unwrap().state(), "open");
    assert_eq!(route.breaker_for("http://c:1").unwrap().state(), "closed");
    assert!(route.breaker_for("http://b:1").is_none());

    // With a dead, traffic flows to c.
    let resp = gw.dispatch(get("/api"), peer()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("x-gateway-backend").unwrap(),
        "http://c:1"
    );
}

#[tokio::test]
async fn failed_reload_keeps_the_old_table() {
    let gw = GatewayService::new(
        &config(vec![route("/api", &["http://a:1"])]),
        Arc::new(OkUpstream),
    )
    .unwrap();
    quiesce(&gw);

    // A backend URL the backend module rejects: reload must fail whole.
    let bad = config(vec![route("/api", &["not-a-url"])]);
    assert!(gw.reload(&bad).is_err());

    let resp = gw.dispatch(get("/api"), peer()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("x-gateway-backend").unwrap(),
        "http://a:1"
    );
}

#[tokio::test]
async fn removed_route_stops_matching() {
    let gw = GatewayService::new(
        &config(vec![
            route("/api", &["http://a:1"]),
            route("/old", &["http://b:1"]),
        ]),
        Arc::new(OkUpstream),
    )
    .unwrap();
    quiesce(&gw);

    assert_eq!(gw.dispatch(get("/old/x"), peer()).await.status(), StatusCode::OK);

    gw.reload(&config(vec![route("/api", &["http://a:1"])])).unwrap();
    quiesce(&gw);

    assert_eq!(
        gw.dispatch(get("/old/x"), peer()).await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(gw.dispatch(get("/api/x"), peer()).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn reload_changing_algorithm_keeps_backend_records() {
    let gw = GatewayService::new(
        &config(vec![route("/api", &["http://a:1", "http://b:1"])]),
        Arc::new(OkUpstream),
    )
    .unwrap();
    quiesce(&gw);

    let a = gw.table().match_route("/api").unwrap().balancer().backends()[0].clone();
    a.set_alive(false);

    let mut changed = route("/api", &["http://a:1", "http://b:1"]);
    changed.lb_algorithm = LbAlgorithm::LeastConn;
    gw.reload(&config(vec![changed])).unwrap();
    quiesce(&gw);

    let backends = gw.table().match_route("/api").unwrap().balancer().backends();
    assert!(Arc::ptr_eq(&backends[0], &a));
    assert!(!backends[0].is_alive());
}

#[tokio::test]
async fn weight_changes_apply_without_identity_loss() {
    let gw = GatewayService::new(
        &config(vec![route("/api", &["http://a:1", "http://b:1"])]),
        Arc::new(OkUpstream),
    )
    .unwrap();
    quiesce(&gw);

    let a = gw.table().match_route("/api").unwrap().balancer().backends()[0].clone();
    assert_eq!(a.weight(), 1);

    let mut changed = route("/api", &["http://a:1", "http://b:1"]);
    changed.backends[0].weight = 9;
    gw.reload(&config(vec![changed])).unwrap();
    quiesce(&gw);

    assert_eq!(a.weight(), 9);
    assert!(Arc::ptr_eq(
        &gw.table().match_route("/api").unwrap().balancer().backends()[0],
        &a
    ));
}
