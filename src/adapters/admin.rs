//! Admin surface, served on its own port so it never sits behind the data
//! plane's routing or rate limiting.
use std::sync::Arc;

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

use crate::core::GatewayService;

/// Build the admin router: Prometheus metrics, liveness, readiness, and a
/// JSON dump of per-route backend state.
pub fn router(gateway: Arc<GatewayService>, metrics_handle: PrometheusHandle) -> Router {
    let ready_gateway = gateway.clone();

    Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .route(
            "/healthz",
            get(|| async { (StatusCode::OK, Json(json!({"status": "ok"}))) }),
        )
        .route(
            "/readyz",
            get(move || {
                let gateway = ready_gateway.clone();
                async move {
                    if gateway.is_ready() {
                        (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
                    } else {
                        (
                            StatusCode::SERVICE_UNAVAILABLE,
                            Json(json!({
                                "status": "not_ready",
                                "reason": "no healthy backends"
                            })),
                        )
                            .into_response()
                    }
                }
            }),
        )
        .route(
            "/backends",
            get(move || {
                let gateway = gateway.clone();
                async move { Json(gateway.backend_report()) }
            }),
        )
}
