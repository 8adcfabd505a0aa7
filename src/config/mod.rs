//! Application configuration.
//!
//! Aggregates broker, RPC and delivery settings into a single
//! `CourierConfig` that can be loaded from a YAML file or environment
//! variables.

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
        }
    }
}

/// RPC client defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default deadline for a call, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

/// Realtime delivery stream configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Durable queue carrying deliver-to-identity events.
    pub queue: String,
    /// Prefetch bound for the delivery consumer.
    pub prefetch: u16,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue: "delivery-events".to_string(),
            prefetch: 100,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Broker connection configuration.
    pub amqp: AmqpConfig,
    /// RPC defaults.
    pub rpc: RpcConfig,
    /// Delivery stream configuration.
    pub delivery: DeliveryConfig,
}

impl CourierConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CourierConfig = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CourierConfig::default();
        assert_eq!(config.amqp.url, "amqp://localhost:5672");
        assert_eq!(config.rpc.timeout_ms, 5000);
        assert_eq!(config.delivery.queue, "delivery-events");
        assert_eq!(config.delivery.prefetch, 100);
    }

    #[test]
    fn test_config_for_test() {
        let config = CourierConfig::for_test();
        assert_eq!(config.rpc.timeout_ms, 5000);
    }
}
