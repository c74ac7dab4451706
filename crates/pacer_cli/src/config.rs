//! Configuration file support for pacer.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `PACER_`, e.g., `PACER_FEED_TOKEN`)
//! 3. Local config file (./pacer.toml)
//! 4. XDG config file (~/.config/pacer/config.toml)
//! 5. Built-in defaults
//!
//! The database URL defaults to `sqlite://~/.local/state/pacer/pacer.db` on Linux
//! (using the XDG state directory) if not explicitly configured.
//!
//! Example config file:
//! ```toml
//! [database]
//! url = "sqlite://~/.local/state/pacer/pacer.db"  # optional, this is the default
//!
//! [feed]
//! url = "https://feed.example.com/api/v1"
//! token = "..."  # or use PACER_FEED_TOKEN env var
//! requests_per_second = 10
//! timeout_secs = 30
//!
//! [sync]
//! refresh_interval_ms = 3600000
//! max_concurrent_jobs = 4
//!
//! [[sync.rate_limits]]
//! label = "15 min"
//! period_ms = 900000
//! limit = 100
//! spread = false
//!
//! [processors]
//! default_ftp = 250
//! peak_periods = [5, 60, 300, 1200]
//! ```

use std::path::PathBuf;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use pacer::manifest::ProcessorConfig;
use serde::Deserialize;
use thiserror::Error;

/// Configuration values that are required by a command but missing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration value '{key}'")]
    Missing { key: &'static str },
}

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Remote activity feed.
    pub feed: FeedConfig,
    /// Sync engine tuning, passed through to the library.
    pub sync: pacer::SyncConfig,
    /// Values read by processors, keyed by the names manifests list as config triggers.
    pub processors: ProcessorConfig,
}

/// Database configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL.
    /// Defaults to `sqlite://~/.local/state/pacer/pacer.db` if not specified.
    pub url: Option<String>,
}

/// Remote feed configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Base URL of the feed API.
    /// Can also be set via PACER_FEED_URL environment variable.
    pub url: Option<String>,
    /// Bearer token.
    /// Can also be set via PACER_FEED_TOKEN environment variable.
    pub token: Option<String>,
    /// Burst ceiling applied in front of the rate limit budget.
    pub requests_per_second: u32,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            requests_per_second: 10,
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/pacer/config.toml)
    /// 3. Local config file (./pacer.toml)
    /// 4. Environment variables with PACER_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(xdg_config) = Self::default_config_path()
            && xdg_config.exists()
        {
            tracing::debug!("Loading config from {:?}", xdg_config);
            builder = builder.add_source(
                File::from(xdg_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let local_config = PathBuf::from("pacer.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./pacer.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // PACER_ prefixed environment variables
        // e.g., PACER_FEED_TOKEN -> feed.token
        builder = builder.add_source(
            Environment::with_prefix("PACER")
                .separator("_")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// Get the database URL, falling back to the default state directory path.
    ///
    /// The `mode=rwc` parameter enables read-write access and creates the file if it
    /// doesn't exist.
    pub fn database_url(&self) -> Option<String> {
        self.database.url.clone().or_else(|| {
            Self::default_state_dir().map(|state_dir| {
                let db_path = state_dir.join("pacer.db");
                format!("sqlite://{}?mode=rwc", db_path.display())
            })
        })
    }

    /// Get the feed base URL.
    pub fn feed_url(&self) -> Result<&str, ConfigError> {
        self.feed
            .url
            .as_deref()
            .ok_or(ConfigError::Missing { key: "feed.url" })
    }

    /// Get the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pacer").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/pacer` or `~/.local/state/pacer`.
    /// On macOS/Windows, falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pacer").map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}
