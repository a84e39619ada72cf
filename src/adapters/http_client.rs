use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Outbound HTTP client built on hyper with rustls.
///
/// One pooled client serves every backend; per-route deadlines are applied
/// by the dispatcher around `send_request`. Redirects are never followed
/// (hyper does not follow them), which is what health probes require.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add a native certificate to the root store");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector);

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        let (mut parts, body) = req.into_parts();

        // Host must match the target backend, not the inbound request.
        let host_value = match (parts.uri.host(), parts.uri.port()) {
            (Some(host), Some(port)) => HeaderValue::from_str(&format!("{host}:{port}")),
            (Some(host), None) => HeaderValue::from_str(host),
            (None, _) => {
                return Err(HttpClientError::InvalidRequest(format!(
                    "outgoing URI has no host: {}",
                    parts.uri
                )));
            }
        }
        .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        parts.headers.insert(header::HOST, host_value);
        parts.version = Version::HTTP_11;

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let outgoing = Request::from_parts(parts, body);

        match self.client.request(outgoing).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed downstream; stale framing headers
                // must not survive the hop.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, Body::new(hyper_body)))
            }
            Err(e) => Err(HttpClientError::ConnectionError(format!(
                "request to {method} {uri} failed: {e}"
            ))),
        }
    }

    async fn probe(&self, url: &str, deadline: Duration) -> HttpClientResult<StatusCode> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(Body::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        match timeout(deadline, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                // Drain the body so the connection can return to the pool.
                let _ = response.into_body().collect().await;
                Ok(status)
            }
            Ok(Err(e)) => Err(HttpClientError::ConnectionError(e.to_string())),
            Err(_) => Err(HttpClientError::Timeout(deadline)),
        }
    }
}
