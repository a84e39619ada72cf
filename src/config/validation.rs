use std::net::SocketAddr;

use thiserror::Error;

use crate::config::models::{Config, RateLimitAlgorithm, RateLimitConfig, RouteConfig};

/// Validation error types.
#[derive(Debug, Error, Clone)]
pub enum ValidationError {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("invalid listen address '{address}': must be in 'IP:PORT' form")]
    InvalidListenAddress { address: String },

    #[error("validation failed:\n{message}")]
    ValidationFailed { message: String },
}

/// Validate a parsed configuration, collecting every problem rather than
/// stopping at the first. A config that fails here is rejected as a whole.
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if config.server.addr.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidListenAddress {
            address: config.server.addr.clone(),
        });
    }
    if config.admin.addr.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidListenAddress {
            address: config.admin.addr.clone(),
        });
    }

    for (i, route) in config.routes.iter().enumerate() {
        validate_route(i, route, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::ValidationFailed {
            message: errors
                .iter()
                .map(|e| format!("  - {e}"))
                .collect::<Vec<_>>()
                .join("\n"),
        })
    }
}

fn validate_route(index: usize, route: &RouteConfig, errors: &mut Vec<ValidationError>) {
    let field = |name: &str| format!("routes[{index}].{name}");

    if route.path_prefix.is_empty() {
        errors.push(ValidationError::MissingField {
            field: field("path_prefix"),
        });
    } else if !route.path_prefix.starts_with('/') {
        errors.push(ValidationError::InvalidField {
            field: field("path_prefix"),
            message: format!("must start with '/', got '{}'", route.path_prefix),
        });
    }

    if route.backends.is_empty() {
        errors.push(ValidationError::MissingField {
            field: field("backends"),
        });
    }
    for (j, backend) in route.backends.iter().enumerate() {
        if !backend.url.starts_with("http://") && !backend.url.starts_with("https://") {
            errors.push(ValidationError::InvalidField {
                field: field(&format!("backends[{j}].url")),
                message: format!("must start with http:// or https://, got '{}'", backend.url),
            });
        }
    }

    if let Some(rl) = &route.rate_limit {
        validate_rate_limit(&field("rate_limit"), rl, errors);
    }

    if let Some(cb) = &route.circuit_breaker {
        if cb.failure_threshold > 100 {
            errors.push(ValidationError::InvalidField {
                field: field("circuit_breaker.failure_threshold"),
                message: format!("must be a percentage 0-100, got {}", cb.failure_threshold),
            });
        }
        if cb.min_requests == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("circuit_breaker.min_requests"),
                message: "must be at least 1".to_string(),
            });
        }
        if cb.half_open_requests == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("circuit_breaker.half_open_requests"),
                message: "must be at least 1".to_string(),
            });
        }
    }
}

fn validate_rate_limit(field: &str, rl: &RateLimitConfig, errors: &mut Vec<ValidationError>) {
    if rl.rate == 0 {
        errors.push(ValidationError::InvalidField {
            field: format!("{field}.rate"),
            message: "must be at least 1".to_string(),
        });
    }

    // Sliding window needs a window, locally and in Redis; the token bucket
    // needs a burst capacity.
    let needs_window =
        rl.algorithm == RateLimitAlgorithm::SlidingWindow || rl.redis_url.is_some();
    if needs_window {
        match &rl.window {
            None => errors.push(ValidationError::MissingField {
                field: format!("{field}.window"),
            }),
            Some(window) => {
                if humantime::parse_duration(window).is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{field}.window"),
                        message: format!("'{window}' is not a duration (try '10s' or '1m')"),
                    });
                }
            }
        }
    } else if rl.burst == 0 {
        errors.push(ValidationError::InvalidField {
            field: format!("{field}.burst"),
            message: "must be at least 1 for token_bucket".to_string(),
        });
    }

    if let Some(url) = &rl.redis_url {
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.redis_url"),
                message: format!("must start with redis:// or rediss://, got '{url}'"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{
        BackendConfig, CircuitBreakerConfig, RateLimitKey, ServerConfig,
    };

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
            lb_algorithm: Default::default(),
            rate_limit: None,
            circuit_breaker: None,
            timeout_seconds: 30,
            strip_prefix: false,
        }
    }

    fn config_with(routes: Vec<RouteConfig>) -> Config {
        Config {
            routes,
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_sane_config() {
        let cfg = config_with(vec![route("/api", &["http://a:1", "https://b:1"])]);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let mut cfg = config_with(vec![route("/api", &["http://a:1"])]);
        cfg.server = ServerConfig {
            addr: "not-an-addr".to_string(),
            ..Default::default()
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_empty_prefix_and_backends() {
        let mut bad = route("", &[]);
        bad.circuit_breaker = Some(CircuitBreakerConfig {
            failure_threshold: 150,
            ..Default::default()
        });
        let err = validate(&config_with(vec![bad])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("path_prefix"));
        assert!(msg.contains("backends"));
        assert!(msg.contains("failure_threshold"));
    }

    #[test]
    fn rejects_non_http_backend() {
        let cfg = config_with(vec![route("/api", &["ftp://a:1"])]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn sliding_window_requires_a_window() {
        let mut r = route("/api", &["http://a:1"]);
        r.rate_limit = Some(RateLimitConfig {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            rate: 10,
            burst: 0,
            window: None,
            key_by: RateLimitKey::Ip,
            redis_url: None,
        });
        assert!(validate(&config_with(vec![r])).is_err());
    }

    #[test]
    fn token_bucket_requires_burst() {
        let mut r = route("/api", &["http://a:1"]);
        r.rate_limit = Some(RateLimitConfig {
            algorithm: RateLimitAlgorithm::TokenBucket,
            rate: 10,
            burst: 0,
            window: None,
            key_by: RateLimitKey::Ip,
            redis_url: None,
        });
        assert!(validate(&config_with(vec![r])).is_err());
    }

    #[test]
    fn bad_window_string_is_rejected() {
        let mut r = route("/api", &["http://a:1"]);
        r.rate_limit = Some(RateLimitConfig {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            rate: 10,
            burst: 0,
            window: Some("eleven".to_string()),
            key_by: RateLimitKey::Ip,
            redis_url: None,
        });
        assert!(validate(&config_with(vec![r])).is_err());
    }
}
