//! # Observability Infrastructure
//!
//! Structured logging setup for the keepsake storage layer using the
//! tracing ecosystem. Components instrument their own operations with
//! `#[instrument]` spans and structured fields; this module only wires the
//! subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::errors::{KeepsakeError, Result};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured default filter. Returns an
/// error if a subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| KeepsakeError::config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| {
        KeepsakeError::config(format!("Failed to initialize tracing subscriber: {}", e))
    })?;

    tracing::info!(
        service_name = %config.service_name,
        json_logs = config.json_logs,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_rejects_bad_filter() {
        let config = ObservabilityConfig {
            log_level: "not=a=valid=filter".to_string(),
            ..Default::default()
        };
        // Only meaningful when RUST_LOG is unset; the filter itself must be
        // rejected before any subscriber is installed.
        if std::env::var("RUST_LOG").is_err() {
            assert!(init_tracing(&config).is_err());
        }
    }
}
