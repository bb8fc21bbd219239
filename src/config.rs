//! Configuration loading.
//!
//! Defaults, then an optional TOML file, then `RINGMASTER_*` environment
//! variables, each layer overriding the previous one.

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Bind address for the HTTP server.
    pub host: String,
    pub port: u16,
    /// Daemon endpoint to connect to at startup, if any.
    pub endpoint: Option<String>,
    /// Multicast group the discovery prober sends to.
    pub multicast_endpoint: String,
    /// Seconds between discovery probes.
    pub probe_interval_secs: u64,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            endpoint: None,
            multicast_endpoint: "udp://237.219.251.97:12027".to_string(),
            probe_interval_secs: 10,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&AppConfig::default()).context("failed to encode defaults")?,
        );

        if let Some(path) = config_path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("RINGMASTER")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }
}
