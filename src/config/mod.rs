//! Configuration management
//!
//! This module handles loading and parsing configuration for the token service.
//! Configuration can be loaded from:
//! - a YAML file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session lifetime and capacity policy
    #[serde(default)]
    pub session: SessionConfig,
    /// Token store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Database configuration (used by the `database` store driver)
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Session token policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sliding window: a token unused for this long is purged by the store
    #[serde(default = "default_inactivity_expiry_seconds")]
    pub inactivity_expiry_seconds: u64,
    /// Ceiling on the lifetime of a whole session family
    #[serde(default = "default_absolute_expiry_seconds")]
    pub absolute_expiry_seconds: u64,
    /// Maximum concurrently live sessions per user
    #[serde(default = "default_max_tokens_per_user")]
    pub max_tokens_per_user: usize,
    /// How long a revoked token is retained so that a replay can be detected
    #[serde(default = "default_reuse_grace_seconds")]
    pub reuse_grace_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_expiry_seconds: default_inactivity_expiry_seconds(),
            absolute_expiry_seconds: default_absolute_expiry_seconds(),
            max_tokens_per_user: default_max_tokens_per_user(),
            reuse_grace_seconds: default_reuse_grace_seconds(),
        }
    }
}

fn default_inactivity_expiry_seconds() -> u64 {
    14 * 24 * 60 * 60 // 14 days
}

fn default_absolute_expiry_seconds() -> u64 {
    90 * 24 * 60 * 60 // 90 days
}

fn default_max_tokens_per_user() -> usize {
    5
}

fn default_reuse_grace_seconds() -> u64 {
    3600
}

/// Token store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store driver (memory, redis or database)
    #[serde(default)]
    pub driver: StoreDriver,
    /// Redis connection URL (required for the redis driver)
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Prefix for every key written to Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            driver: StoreDriver::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "refresh_token".to_string()
}

/// Token store driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// In-process store (default)
    #[default]
    Memory,
    /// Redis, shared between service instances
    Redis,
    /// SQL database through sqlx
    Database,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or mysql)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "data/refresh_tokens.db".to_string()
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - REFRESH_GUARD_SESSION_INACTIVITY_EXPIRY_SECONDS
    /// - REFRESH_GUARD_SESSION_ABSOLUTE_EXPIRY_SECONDS
    /// - REFRESH_GUARD_SESSION_MAX_TOKENS_PER_USER
    /// - REFRESH_GUARD_SESSION_REUSE_GRACE_SECONDS
    /// - REFRESH_GUARD_STORE_DRIVER
    /// - REFRESH_GUARD_STORE_REDIS_URL
    /// - REFRESH_GUARD_STORE_KEY_PREFIX
    /// - REFRESH_GUARD_DATABASE_DRIVER
    /// - REFRESH_GUARD_DATABASE_URL
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        // Session policy
        if let Some(v) = env_parsed("REFRESH_GUARD_SESSION_INACTIVITY_EXPIRY_SECONDS") {
            self.session.inactivity_expiry_seconds = v;
        }
        if let Some(v) = env_parsed("REFRESH_GUARD_SESSION_ABSOLUTE_EXPIRY_SECONDS") {
            self.session.absolute_expiry_seconds = v;
        }
        if let Some(v) = env_parsed("REFRESH_GUARD_SESSION_MAX_TOKENS_PER_USER") {
            self.session.max_tokens_per_user = v;
        }
        if let Some(v) = env_parsed("REFRESH_GUARD_SESSION_REUSE_GRACE_SECONDS") {
            self.session.reuse_grace_seconds = v;
        }

        // Store configuration
        if let Ok(driver) = std::env::var("REFRESH_GUARD_STORE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "memory" => self.store.driver = StoreDriver::Memory,
                "redis" => self.store.driver = StoreDriver::Redis,
                "database" => self.store.driver = StoreDriver::Database,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(redis_url) = std::env::var("REFRESH_GUARD_STORE_REDIS_URL") {
            self.store.redis_url = Some(redis_url);
        }
        if let Ok(prefix) = std::env::var("REFRESH_GUARD_STORE_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }

        // Database configuration
        if let Ok(driver) = std::env::var("REFRESH_GUARD_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                _ => {}
            }
        }
        if let Ok(url) = std::env::var("REFRESH_GUARD_DATABASE_URL") {
            self.database.url = url;
        }
    }

    /// Check the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        if self.store.driver == StoreDriver::Redis && self.store.key_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "store.key_prefix must not be empty when using redis".to_string(),
            ));
        }
        Ok(())
    }
}

impl SessionConfig {
    /// Check the values that would make the token protocol meaningless.
    ///
    /// A zero grace window in particular would drop consumed tokens at once
    /// and a replay could no longer be recognized.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = self;
        if session.inactivity_expiry_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "session.inactivity_expiry_seconds must be greater than 0".to_string(),
            ));
        }
        if session.absolute_expiry_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "session.absolute_expiry_seconds must be greater than 0".to_string(),
            ));
        }
        if session.max_tokens_per_user == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_tokens_per_user must be at least 1".to_string(),
            ));
        }
        if session.reuse_grace_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "session.reuse_grace_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read an environment variable and parse it, ignoring unparsable values
fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
