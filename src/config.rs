//! Session configuration model, defaults and loading.

use std::path::{Path, PathBuf};

use log::{info, warn, LevelFilter};
use thiserror::Error;

const APP_DIR_NAME: &str = "meregaane";
const API_KEY_ENV_VAR: &str = "YOUTUBE_API_KEY";

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SessionConfig {
    #[serde(default)]
    /// Volume and position-reporting preferences.
    pub playback: PlaybackConfig,
    #[serde(default)]
    /// Retention limits for history and recent searches.
    pub history: HistoryConfig,
    #[serde(default)]
    /// Autoplay continuation tuning.
    pub continuation: ContinuationConfig,
    #[serde(default)]
    /// Remote metadata provider settings.
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    #[serde(default = "default_position_poll_interval_ms")]
    pub position_poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
    #[serde(default = "default_recent_search_capacity")]
    pub recent_search_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ContinuationConfig {
    /// Tracks fetched per continuation: the first plays, the rest are queued.
    #[serde(default = "default_continuation_limit")]
    pub limit: usize,
    /// How many of the most-played artists feed the secondary query.
    #[serde(default = "default_top_artist_count")]
    pub top_artist_count: usize,
    /// Result multiplier requested when prevent-repeat filtering will discard hits.
    #[serde(default = "default_prevent_repeat_headroom")]
    pub prevent_repeat_headroom: usize,
    #[serde(default = "default_query_suffix")]
    pub query_suffix: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_metadata_base_url")]
    pub base_url: String,
    #[serde(default = "default_search_suffix")]
    pub search_suffix: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    /// SQLite file for persisted session state; the platform data directory when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            position_poll_interval_ms: default_position_poll_interval_ms(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
            recent_search_capacity: default_recent_search_capacity(),
        }
    }
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            limit: default_continuation_limit(),
            top_artist_count: default_top_artist_count(),
            prevent_repeat_headroom: default_prevent_repeat_headroom(),
            query_suffix: default_query_suffix(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_metadata_base_url(),
            search_suffix: default_search_suffix(),
            request_timeout_secs: default_request_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    /// Parses the configured level, falling back to `Info`.
    pub fn level_filter(&self) -> LevelFilter {
        self.level.trim().parse().unwrap_or(LevelFilter::Info)
    }
}

fn default_volume() -> u8 {
    70
}

fn default_position_poll_interval_ms() -> u64 {
    1_000
}

fn default_history_capacity() -> usize {
    crate::history::DEFAULT_HISTORY_CAPACITY
}

fn default_recent_search_capacity() -> usize {
    crate::history::DEFAULT_RECENT_SEARCH_CAPACITY
}

fn default_continuation_limit() -> usize {
    5
}

fn default_top_artist_count() -> usize {
    3
}

fn default_prevent_repeat_headroom() -> usize {
    2
}

fn default_query_suffix() -> String {
    "similar songs".to_string()
}

fn default_metadata_base_url() -> String {
    "https://www.googleapis.com/youtube/v3".to_string()
}

fn default_search_suffix() -> String {
    "music".to_string()
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_bus_capacity() -> usize {
    1_024
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl SessionConfig {
    /// Clamps values that would stall or break the session.
    pub fn sanitize(mut self) -> Self {
        self.playback.default_volume = self.playback.default_volume.min(100);
        self.playback.position_poll_interval_ms =
            self.playback.position_poll_interval_ms.clamp(50, 60_000);
        self.history.capacity = self.history.capacity.clamp(1, 1_000);
        self.history.recent_search_capacity = self.history.recent_search_capacity.clamp(1, 100);
        self.continuation.limit = self.continuation.limit.clamp(1, 50);
        self.continuation.top_artist_count = self.continuation.top_artist_count.max(1);
        self.continuation.prevent_repeat_headroom =
            self.continuation.prevent_repeat_headroom.clamp(1, 10);
        self.metadata.request_timeout_secs = self.metadata.request_timeout_secs.clamp(1, 120);
        self.bus.capacity = self.bus.capacity.max(64);
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str::<SessionConfig>(content)?.sanitize())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Reads `path`, writing a default file first when it does not exist.
    /// Unreadable or invalid files fall back to defaults.
    pub fn load_or_create(path: &Path) -> Self {
        if !path.exists() {
            info!(
                "Config file not found. Creating default config. path={}",
                path.display()
            );
            if let Err(err) = Self::write_default(path) {
                warn!("Failed to write default config {}: {}", path.display(), err);
            }
        }

        let config = match std::fs::read_to_string(path)
            .map_err(ConfigError::from)
            .and_then(|content| Self::from_toml_str(&content))
        {
            Ok(config) => config,
            Err(err) => {
                warn!("Using default config, {}: {}", path.display(), err);
                Self::default()
            }
        };
        config.with_env_overrides()
    }

    fn write_default(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::default().to_toml_string()?)?;
        Ok(())
    }

    /// Takes the API key from the environment when the file leaves it empty.
    pub fn with_env_overrides(mut self) -> Self {
        if self.metadata.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var(API_KEY_ENV_VAR) {
                self.metadata.api_key = key.trim().to_string();
            }
        }
        self
    }

    /// Database location: the configured path, else the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage
            .database_path
            .clone()
            .or_else(default_database_path)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
}

pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_DIR_NAME).join("session.db"))
}
