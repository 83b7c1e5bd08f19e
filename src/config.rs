//! Engine Configuration
//!
//! Loaded from a JSON file. Every field has a default, so `{}` is a valid
//! configuration for a single-process deployment.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::{BrokerSettings, FeedRetry};
use crate::engine::Topology;
use crate::mutation::{LockTiming, RetryPolicy};
use crate::observability::LogFormat;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Invalid config JSON: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Objects per backfill page (default: 50)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Lifetime of an object lock (default: 5000ms)
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// How long a writer waits for a held lock (default: 250ms)
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Caller-side retry of lock conflicts
    #[serde(default)]
    pub lock_retry: RetryPolicy,

    /// Change feed reconnect budget
    #[serde(default)]
    pub feed_retry: FeedRetry,

    /// Bound of each broker pipeline channel (default: 1024)
    #[serde(default = "default_pipeline_capacity")]
    pub pipeline_capacity: usize,

    #[serde(default)]
    pub topology: Topology,

    #[serde(default)]
    pub socket: SocketConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_page_size() -> usize {
    50
}

fn default_lock_ttl_ms() -> u64 {
    5000
}

fn default_lock_wait_ms() -> u64 {
    250
}

fn default_pipeline_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            lock_retry: RetryPolicy::default(),
            feed_retry: FeedRetry::default(),
            pipeline_capacity: default_pipeline_capacity(),
            topology: Topology::default(),
            socket: SocketConfig::default(),
            auth: AuthConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let config: EngineConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject sizes and budgets that would stall the engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be > 0".into()));
        }
        if self.lock_ttl_ms == 0 {
            return Err(ConfigError::Invalid("lock_ttl_ms must be > 0".into()));
        }
        if self.pipeline_capacity == 0 {
            return Err(ConfigError::Invalid("pipeline_capacity must be > 0".into()));
        }
        if self.lock_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "lock_retry.max_attempts must be > 0".into(),
            ));
        }
        if self.feed_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "feed_retry.max_attempts must be > 0".into(),
            ));
        }
        if self.socket.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid("socket.heartbeat_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn lock_timing(&self) -> LockTiming {
        LockTiming {
            ttl: Duration::from_millis(self.lock_ttl_ms),
            wait: Duration::from_millis(self.lock_wait_ms),
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            pipeline_capacity: self.pipeline_capacity,
            feed_retry: self.feed_retry,
        }
    }
}

/// Websocket front end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Address to listen on (default: "127.0.0.1:9090")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Interval between pings (default: 30s)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

/// Bearer token verification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the login service. Unset disables sockets.
    #[serde(default)]
    pub secret: Option<String>,

    /// Expected `aud` claim, if any
    #[serde(default)]
    pub audience: Option<String>,
}

/// Log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive (default: "info"); `AEROLIVE_LOG` overrides it
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
