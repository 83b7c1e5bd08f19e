//! Structured logging setup
//!
//! Installs a `tracing-subscriber` fmt subscriber. The filter comes from
//! `AEROLIVE_LOG` when set, otherwise from the configured level.

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::ObservabilityError;

/// Environment variable overriding the configured filter
pub const LOG_ENV: &str = "AEROLIVE_LOG";

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn build_env_filter(level: &str) -> Result<EnvFilter, ObservabilityError> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return Ok(filter);
    }
    EnvFilter::try_new(level)
        .map_err(|e| ObservabilityError::InvalidFilter(format!("{}: {}", level, e)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(format: LogFormat, level: &str) -> Result<(), ObservabilityError> {
    let filter = build_env_filter(level)?;

    let layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| ObservabilityError::AlreadyInstalled(e.to_string()))
}
