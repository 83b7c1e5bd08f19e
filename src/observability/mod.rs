//! Observability
//!
//! - Structured logging through `tracing`
//! - Monotonic operational counters

mod logging;
mod metrics;

pub use logging::{init_logging, LogFormat, LOG_ENV};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

use thiserror::Error;

/// Observability setup errors. Never fatal to the engine itself.
#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Logging already initialised: {0}")]
    AlreadyInstalled(String),
}
