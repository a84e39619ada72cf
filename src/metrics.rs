//! Gateway metrics.
//!
//! Thin helpers over the `metrics` facade macros, with the Prometheus
//! recorder installed once at startup and rendered by the admin `/metrics`
//! endpoint. Families:
//! * `gateway_requests_total{route,method,status}` (counter)
//! * `gateway_request_duration_seconds{route,method}` (histogram)
//! * `gateway_active_connections` (gauge)
use std::time::Duration;

use eyre::Result;
use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const GATEWAY_ACTIVE_CONNECTIONS: &str = "gateway_active_connections";

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Install the process-global Prometheus recorder and register metric
/// descriptions. Returns the handle the admin endpoint renders from.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(GATEWAY_REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;

    describe_counter!(
        GATEWAY_REQUESTS_TOTAL,
        Unit::Count,
        "Total HTTP requests processed by the gateway."
    );
    describe_histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Histogram of HTTP request latencies."
    );
    describe_gauge!(
        GATEWAY_ACTIVE_CONNECTIONS,
        "Number of currently active proxy connections."
    );

    Ok(handle)
}

/// Record one completed request against its matched route.
pub fn observe_request(route: &str, method: &str, status: u16, duration: Duration) {
    counter!(
        GATEWAY_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn connection_opened() {
    gauge!(GATEWAY_ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn connection_closed() {
    gauge!(GATEWAY_ACTIVE_CONNECTIONS).decrement(1.0);
}
