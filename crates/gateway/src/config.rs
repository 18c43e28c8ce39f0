//! Configuration file handling
//!
//! The TOML file has one section per concern. Every section is optional and
//! every key inside a section falls back to its default.

use crate::args::Args;
use anyhow::{Context, Result};
use gateway_server::{GatewayConfig, RegistryConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingSettings,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Applies command-line overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = &args.listen {
            self.gateway.listen = listen.clone();
        }
        if let Some(backend) = args.backend {
            self.gateway.backend = backend;
            self.worker.backend = backend;
        }
        if args.debug {
            self.logging.level = "debug".to_string();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        self.gateway.validate().map_err(|e| e.to_string())?;

        if self.registry.directory.as_os_str().is_empty() {
            return Err("Registry directory cannot be empty".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

/// Load configuration from file or create default configuration
///
/// # Arguments
/// * `path` - Path to the TOML configuration file
///
/// # Returns
/// * `Result<AppConfig>` - The loaded or default configuration
///
/// # Errors
/// * Returns error if file I/O operations fail
/// * Returns error if TOML parsing fails
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match toml::from_str::<AppConfig>(&config_str) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Failed to parse config file {}: {}", path.display(), e);
                Err(e).with_context(|| format!("Invalid configuration in {}", path.display()))
            }
        }
    } else {
        warn!("Configuration file not found: {}, using defaults", path.display());

        let default_config = AppConfig::default();
        let config_str = toml::to_string_pretty(&default_config)?;
        std::fs::write(path, config_str)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Created default configuration file: {}", path.display());

        Ok(default_config)
    }
}
