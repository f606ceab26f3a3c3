//! Tracing and logging setup.
//!
//! Logging to stdout is always enabled. The filter comes from the
//! `CBTRAINER_LOG` environment variable in `EnvFilter` syntax and
//! falls back to the configured log level. Exporting traces to an
//! OpenTelemetry collector is optional and disabled by default.

use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use crate::config::OtlpConfig;
use crate::errors::{ConfigError, TrainerError};

pub mod otlp_tracing;

pub const LOG_ENV_VAR: &str = "CBTRAINER_LOG";

/// Build the log filter, preferring `CBTRAINER_LOG` when it is set.
fn log_filter(log_level: &str) -> Result<EnvFilter, ConfigError> {
    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
            .map_err(|err| ConfigError::LogLevel(format!("{LOG_ENV_VAR}={directives}: {err}"))),
        _ => parse_log_level(log_level),
    }
}

fn parse_log_level(log_level: &str) -> Result<EnvFilter, ConfigError> {
    match log_level.to_lowercase().as_str() {
        level @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => {
            EnvFilter::try_new(level).map_err(|err| ConfigError::LogLevel(err.to_string()))
        }
        level => Err(ConfigError::LogLevel(level.to_owned())),
    }
}

/// Install the global subscriber.
///
/// Must be called from within a Tokio runtime if `otlp` is set, as the
/// trace exporter runs on it.
pub fn setup(log_level: &str, otlp: Option<&OtlpConfig>) -> Result<(), TrainerError> {
    let filter = log_filter(log_level)?;

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);

    let telemetry = otlp
        .map(otlp_tracing::build)
        .transpose()?
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    set_global_subscriber(Registry::default().with(filter).with(logs).with(telemetry));
    Ok(())
}

// Setting a global subscriber twice only happens in tests, or when
// embedding the trainer; keep the first one.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert!(parse_log_level("INFO").is_ok());
    assert!(parse_log_level("debug").is_ok());
    assert!(matches!(
        parse_log_level("loud"),
        Err(ConfigError::LogLevel(level)) if level == "loud"
    ));
}
