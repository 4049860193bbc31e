//! # Paging Engine Configuration
//!
//! YAML-based configuration with per-environment overrides, validated once
//! at load time.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use paging_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration (environment auto-detected)
//! let config = ConfigManager::load()?;
//!
//! let database_url = config.config().database_url();
//! let cycle_time = config.config().engine.cycle_time();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{engine, queue};
use crate::message::types::DestType;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Highest accepted `messaging.max_retries`.
const MAX_RETRIES_LIMIT: u32 = 10;

/// Pool size given either as an integer or as `{ max_connections: N }`.
fn deserialize_pool_config<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let value: Value = Deserialize::deserialize(deserializer)?;

    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("Pool value must be a positive integer"))?
            .try_into()
            .map_err(|_| D::Error::custom("Pool size exceeds maximum allowed value (u32::MAX)")),
        Value::Object(obj) => obj
            .get("max_connections")
            .ok_or_else(|| D::Error::custom("Structured pool format requires max_connections field"))?
            .as_u64()
            .ok_or_else(|| D::Error::custom("max_connections must be a number"))?
            .try_into()
            .map_err(|_| D::Error::custom("max_connections exceeds maximum allowed value (u32::MAX)")),
        _ => Err(D::Error::custom(
            "Pool must be either an integer or an object with max_connections",
        )),
    }
}

/// Root configuration structure mirroring paging-config.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Environment the config was loaded for; set by the loader.
    pub environment: String,

    /// Database connection and pooling configuration
    pub database: DatabaseConfig,

    /// Engine loop configuration
    pub engine: EngineConfig,

    /// Message sending configuration
    pub messaging: MessagingConfig,
}

/// Database connection and pooling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub username: String,
    pub password: String,
    /// Environment-specific database name override
    pub database: Option<String>,
    #[serde(deserialize_with = "deserialize_pool_config")]
    pub pool: u32,
    pub checkout_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            database: None,
            pool: 10,
            checkout_timeout_seconds: 10,
        }
    }
}

impl DatabaseConfig {
    /// Get database name for the current environment
    pub fn database_name(&self, environment: &str) -> String {
        if let Some(db_name) = &self.database {
            return db_name.clone();
        }

        match environment {
            "production" => "paging".to_string(),
            _ => format!("paging_{environment}"),
        }
    }

    /// Build complete database URL from configuration
    pub fn database_url(&self, environment: &str) -> String {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }

        let port = std::env::var("DATABASE_PORT").unwrap_or_else(|_| "5432".to_string());
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            port,
            self.database_name(environment)
        )
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_seconds)
    }
}

/// Engine loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cycle_time_ms: u64,
    /// Log the start and end of every cycle.
    pub log_cycles: bool,
    /// API-only mode: answer pause requests and status callbacks, never
    /// run a cycle.
    pub disable_cycle: bool,
    pub module_timeout_seconds: u64,
    pub message_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_time_ms: engine::DEFAULT_CYCLE_TIME.as_millis() as u64,
            log_cycles: false,
            disable_cycle: false,
            module_timeout_seconds: engine::MODULE_TIMEOUT.as_secs(),
            message_timeout_seconds: engine::MESSAGE_PHASE_TIMEOUT.as_secs(),
        }
    }
}

impl EngineConfig {
    pub fn cycle_time(&self) -> Duration {
        Duration::from_millis(self.cycle_time_ms)
    }

    pub fn module_timeout(&self) -> Duration {
        Duration::from_secs(self.module_timeout_seconds)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_seconds)
    }
}

/// Send rate for one destination type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateConfig {
    pub per_second: u32,
    pub batch_ms: u64,
}

impl RateConfig {
    pub const fn new(per_second: u32, batch_ms: u64) -> Self {
        Self {
            per_second,
            batch_ms,
        }
    }

    /// Built-in rate for `dest_type`.
    pub fn default_for(dest_type: DestType) -> Self {
        match dest_type {
            DestType::Sms | DestType::Voice => Self::new(1, 5_000),
            DestType::Email => Self::new(10, 5_000),
            _ => Self::new(5, 5_000),
        }
    }

    pub fn batch(&self) -> Duration {
        Duration::from_millis(self.batch_ms)
    }

    /// Messages allowed per batch window. A rate that rounds down to zero
    /// messages per window (including `per_second: 0`) is unlimited.
    pub fn budget(&self) -> usize {
        match self.batch_ms.saturating_mul(u64::from(self.per_second)) / 1000 {
            0 => usize::MAX,
            budget => usize::try_from(budget).unwrap_or(usize::MAX),
        }
    }
}

/// Message sending configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub disable_bundling: bool,
    pub workers_per_type: usize,
    pub send_timeout_ms: u64,
    /// Lease on a message marked `sending`.
    pub sending_deadline_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    /// Idle holders of the sending lock older than this are terminated.
    pub stale_lock_seconds: u64,
    /// `queued_remotely` messages older than this get a status refresh.
    pub stuck_after_seconds: u64,
    pub stuck_batch_size: u32,
    pub history_window_seconds: u64,
    pub rate_limits: HashMap<DestType, RateConfig>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            disable_bundling: false,
            workers_per_type: queue::WORKERS_PER_TYPE,
            send_timeout_ms: 5_000,
            sending_deadline_seconds: 10,
            max_retries: 3,
            retry_delay_seconds: 15,
            stale_lock_seconds: 60,
            stuck_after_seconds: 60,
            stuck_batch_size: 10,
            history_window_seconds: queue::SENT_HISTORY_WINDOW.as_secs(),
            rate_limits: HashMap::new(),
        }
    }
}

impl MessagingConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn sending_deadline(&self) -> Duration {
        Duration::from_secs(self.sending_deadline_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn stale_lock(&self) -> Duration {
        Duration::from_secs(self.stale_lock_seconds)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_seconds)
    }

    pub fn history_window(&self) -> Duration {
        Duration::from_secs(self.history_window_seconds)
    }

    /// Configured rate for `dest_type`, falling back to the built-in one.
    pub fn rate_limit(&self, dest_type: DestType) -> RateConfig {
        self.rate_limits
            .get(&dest_type)
            .copied()
            .unwrap_or_else(|| RateConfig::default_for(dest_type))
    }
}

impl PagingConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.host.is_empty() && self.database.url.is_none() {
            return Err(ConfigurationError::missing_required_field(
                "database.host",
                "database configuration",
            ));
        }

        if self.database.pool == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.pool",
                "0",
                "pool size must be greater than 0",
            ));
        }

        if self.engine.cycle_time_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.cycle_time_ms",
                "0",
                "cycle time must be greater than 0",
            ));
        }

        if self.messaging.workers_per_type == 0 {
            return Err(ConfigurationError::invalid_value(
                "messaging.workers_per_type",
                "0",
                "at least one worker is required",
            ));
        }

        if self.messaging.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigurationError::invalid_value(
                "messaging.max_retries",
                self.messaging.max_retries.to_string(),
                format!("must not exceed {MAX_RETRIES_LIMIT}"),
            ));
        }

        for (dest_type, rate) in &self.messaging.rate_limits {
            if rate.batch_ms == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("messaging.rate_limits.{dest_type}.batch_ms"),
                    "0",
                    "batch window must be greater than 0",
                ));
            }
        }

        Ok(())
    }

    /// Get database URL for the current environment
    pub fn database_url(&self) -> String {
        self.database.database_url(&self.environment)
    }

    /// Check if running in test environment
    pub fn is_test_environment(&self) -> bool {
        self.environment == "test"
    }
}
