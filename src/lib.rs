//! Portcullis - a reverse-proxy API gateway.
//!
//! A single-process data plane that, per inbound request, selects a route by
//! longest path prefix, enforces a per-route rate limit, picks a healthy
//! backend under a configurable balancing policy, consults a per-backend
//! circuit breaker, and forwards the request while feeding the outcome back
//! into health and breaker state.
//!
//! # Features
//! - Four load-balancing policies: round-robin, least-connections, smooth
//!   weighted round-robin, and IP hash
//! - Per-backend three-state circuit breakers over a rolling outcome window
//! - Per-key rate limiting: token bucket and sliding window in process, or a
//!   sliding window shared through Redis (fail-open on store trouble)
//! - Active health checking with automatic backend recovery
//! - Live configuration reload that preserves backend health and breaker
//!   state across the swap
//! - Prometheus metrics and structured `tracing` logs
//! - Separate admin port: `/metrics`, `/healthz`, `/readyz`, `/backends`
//!
//! # Quick example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portcullis::{adapters::HttpClientAdapter, config, core::GatewayService};
//!
//! # fn main() -> eyre::Result<()> {
//! let cfg = config::load_config("gateway.yaml")?;
//! let client = Arc::new(HttpClientAdapter::new()?);
//! let gateway = Arc::new(GatewayService::new(&cfg, client)?);
//! // Wire `gateway` into the HttpHandler adapter (see the binary crate).
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) and keeps the request-dispatch logic inside `core`.
//! The hot path touches at most two locks: the selected key's rate-limit
//! bucket and the selected backend's breaker. Everything else is atomics or
//! an `ArcSwap` snapshot read.
//!
//! # Error handling
//! Fallible plumbing returns `eyre::Result` with context attached; domain
//! conditions (`NoHealthyBackend`, `CircuitOpen`, `RateLimited`) are typed
//! errors in their modules.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FileConfigProvider, HealthChecker, HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
