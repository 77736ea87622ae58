//! Configuration management for CertSentry
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. Settings are layered
//! with the `figment` crate: built-in defaults, then an optional TOML file,
//! then `CERTSENTRY_`-prefixed environment variables.

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ctlog: CtLogConfig,
}

/// Configuration for core application settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Configuration for the HTTP API server.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: SocketAddr,
    /// Origin allowed by the CORS layer; "*" allows any.
    pub cors_allow_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            cors_allow_origin: "http://localhost:3000".to_string(),
        }
    }
}

/// Configuration for the durable store.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://certsentry.db".to_string(),
        }
    }
}

/// Configuration for the CT log poller.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CtLogConfig {
    /// Base URL of the RFC 6962 log to poll.
    pub base_url: String,
    /// Delay between worker ticks, in seconds.
    pub interval_seconds: u64,
    /// Max entries per tick; also the size of the initial near-head window.
    pub batch_size: i64,
    /// Caught-up policy: re-match the last batch on idle ticks instead of
    /// skipping. Meant for demos and testing.
    pub reprocess_on_idle: bool,
}

impl Default for CtLogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://oak.ct.letsencrypt.org/2026h2".to_string(),
            interval_seconds: 60,
            batch_size: 100,
            reprocess_on_idle: false,
        }
    }
}

impl CtLogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Config {
    /// Loads the application configuration by parsing command-line arguments.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from_cli(Cli::parse())
    }

    /// Loads the configuration from a given `Cli` struct. Split out so
    /// tests can drive it without a process-level argv.
    pub fn load_from_cli(cli: Cli) -> anyhow::Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = &cli.config {
            if !path.exists() {
                anyhow::bail!("config file not found at specified path: {:?}", path);
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("CERTSENTRY_").split("__"));

        figment
            .extract()
            .map_err(|e| anyhow::anyhow!("configuration loading error: {}", e))
    }
}
