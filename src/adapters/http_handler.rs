use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::body::Body;
use http::header::HeaderValue;
use hyper::{Request, Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::{core::GatewayService, metrics, tracing_setup};

const HEADER_REQUEST_ID: &str = "x-request-id";

/// Serving-port glue around the dispatcher: request IDs, the request span,
/// the access log line, and the active-connection gauge.
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    pub async fn handle(&self, mut req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let request_id = req
            .headers()
            .get(HEADER_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(HEADER_REQUEST_ID, value);
        }

        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let span = tracing_setup::request_span(&method, &path, &request_id);

        metrics::connection_opened();
        let start = Instant::now();
        let mut response = self
            .gateway
            .dispatch(req, peer)
            .instrument(span.clone())
            .await;
        metrics::connection_closed();

        let duration = start.elapsed();
        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", duration.as_millis() as u64);
        tracing::info!(
            parent: &span,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            duration_ms = duration.as_millis() as u64,
            remote_addr = %peer,
            "request"
        );

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(HEADER_REQUEST_ID, value);
        }
        response
    }
}
