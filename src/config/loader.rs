use config::{File, FileFormat};
use eyre::{Result, WrapErr};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{models::Config, validation};

/// `${NAME}` references, expanded before parsing. Unset variables expand to
/// the empty string, matching common shell semantics.
static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env ref regex"));

/// Load, env-expand, parse, and validate a YAML configuration file.
///
/// Returns an error (and leaves the caller's current config untouched) on
/// any read, parse, or validation failure.
pub fn load_config(path: &str) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read config file {path}"))?;

    let expanded = expand_env(&raw);

    let settings = config::Config::builder()
        .add_source(File::from_str(&expanded, FileFormat::Yaml))
        .build()
        .wrap_err_with(|| format!("failed to parse config from {path}"))?;

    let cfg: Config = settings
        .try_deserialize()
        .wrap_err_with(|| format!("failed to deserialize config from {path}"))?;

    validation::validate(&cfg).wrap_err_with(|| format!("invalid config in {path}"))?;

    Ok(cfg)
}

fn expand_env(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{LbAlgorithm, RateLimitKey};

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn loads_a_minimal_config_with_defaults() {
        let file = write_config(
            r#"
routes:
  - path_prefix: /api
    backends:
      - url: http://localhost:3001
"#,
        );

        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.server.addr, "0.0.0.0:8080");
        assert_eq!(cfg.routes.len(), 1);
        let route = &cfg.routes[0];
        assert_eq!(route.path_prefix, "/api");
        assert_eq!(route.lb_algorithm, LbAlgorithm::RoundRobin);
        assert_eq!(route.timeout_seconds, 30);
        assert_eq!(route.backends[0].weight, 1);
        assert!(!route.strip_prefix);
    }

    #[test]
    fn loads_a_full_route() {
        let file = write_config(
            r#"
server:
  addr: 127.0.0.1:8085
routes:
  - path_prefix: /svc
    strip_prefix: true
    timeout_seconds: 5
    lb_algorithm: weighted
    backends:
      - url: http://a:1
        weight: 5
      - url: http://b:1
    rate_limit:
      algorithm: sliding_window
      rate: 10
      window: 1m
      key_by: api_key
    circuit_breaker:
      failure_threshold: 60
      min_requests: 10
"#,
        );

        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        let route = &cfg.routes[0];
        assert_eq!(route.lb_algorithm, LbAlgorithm::Weighted);
        assert!(route.strip_prefix);
        assert_eq!(route.backends[0].weight, 5);
        assert_eq!(route.backends[1].weight, 1);

        let rl = route.rate_limit.as_ref().unwrap();
        assert_eq!(rl.rate, 10);
        assert_eq!(rl.key_by, RateLimitKey::ApiKey);

        let cb = route.circuit_breaker.as_ref().unwrap();
        assert_eq!(cb.failure_threshold, 60);
        assert_eq!(cb.min_requests, 10);
        // Unset breaker fields take documented defaults.
        assert_eq!(cb.open_duration_seconds, 30);
        assert_eq!(cb.half_open_requests, 5);
    }

    #[test]
    fn expands_environment_references() {
        std::env::set_var("PORTCULLIS_TEST_BACKEND", "http://from-env:9999");
        let file = write_config(
            r#"
routes:
  - path_prefix: /api
    backends:
      - url: ${PORTCULLIS_TEST_BACKEND}
"#,
        );

        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.routes[0].backends[0].url, "http://from-env:9999");
    }

    #[test]
    fn rejects_invalid_yaml() {
        let file = write_config("routes: [not yaml: {{");
        assert!(load_config(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_route_without_backends() {
        let file = write_config(
            r#"
routes:
  - path_prefix: /api
    backends: []
"#,
        );
        assert!(load_config(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config("/definitely/not/here.yaml").is_err());
    }
}
