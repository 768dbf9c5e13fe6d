//! # Configuration Management
//!
//! Environment-driven configuration for the keepsake storage layer.

use std::time::Duration;

use crate::errors::{KeepsakeError, Result};

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            observability: ObservabilityConfig::from_env(),
        })
    }
}

/// Database connection configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection URL; only `sqlite:` URLs are supported
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    /// Apply pending migrations when the pool is created
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://keepsake.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            idle_timeout_secs: Some(600),
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let url =
            std::env::var("KEEPSAKE_DATABASE_URL").unwrap_or_else(|_| defaults.url.clone());

        let max_connections = parse_env_var("KEEPSAKE_DATABASE_MAX_CONNECTIONS")?
            .unwrap_or(defaults.max_connections);
        let min_connections = parse_env_var("KEEPSAKE_DATABASE_MIN_CONNECTIONS")?
            .unwrap_or(defaults.min_connections);
        let connect_timeout_secs = parse_env_var("KEEPSAKE_DATABASE_CONNECT_TIMEOUT_SECS")?
            .unwrap_or(defaults.connect_timeout_secs);
        let auto_migrate =
            parse_env_var("KEEPSAKE_DATABASE_AUTO_MIGRATE")?.unwrap_or(defaults.auto_migrate);

        Ok(Self {
            url,
            max_connections,
            min_connections,
            connect_timeout_secs,
            idle_timeout_secs: defaults.idle_timeout_secs,
            auto_migrate,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub service_name: String,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit logs as JSON instead of human-readable lines
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "keepsake".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("KEEPSAKE_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            log_level: std::env::var("KEEPSAKE_LOG_LEVEL").unwrap_or(defaults.log_level),
            json_logs: std::env::var("KEEPSAKE_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.json_logs),
        }
    }
}

fn parse_env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| KeepsakeError::config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}
