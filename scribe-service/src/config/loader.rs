//! Configuration loading from files and environment variables.

use config::{Config, Environment, File};

use crate::error::{ServiceError, ServiceResult};

use super::ServiceConfig;

/// Environment variable naming an alternative config file (without extension)
const CONFIG_PATH_VAR: &str = "SCRIBE_CONFIG";

/// Load configuration from `config.toml` (or `$SCRIBE_CONFIG`) and `SCRIBE__*` env vars
pub fn load_config() -> ServiceResult<ServiceConfig> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "config".to_string());
    build(Config::builder().add_source(File::with_name(&path).required(false)))
}

fn build(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> ServiceResult<ServiceConfig> {
    builder
        .add_source(
            Environment::with_prefix("SCRIBE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize config: {}", e),
        })
}
