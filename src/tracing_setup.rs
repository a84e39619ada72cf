use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Initialize structured logging from the `logging` config section.
///
/// `RUST_LOG` wins over the configured level when set, so operators can
/// raise verbosity without touching the config file.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(&cfg.level)
            .wrap_err_with(|| format!("invalid log level '{}'", cfg.level))?,
    };

    match cfg.format {
        LogFormat::Json => {
            Registry::default()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_span_list(true)
                        .with_target(true),
                )
                .init();
        }
        LogFormat::Console => {
            Registry::default()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
                .init();
        }
    }

    Ok(())
}

/// Create a request-scoped span; status and duration are recorded when the
/// request completes.
pub fn request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}
