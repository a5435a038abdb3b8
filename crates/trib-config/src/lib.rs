//! # trib-config
//!
//! Configuration management for Tributary.
//!
//! Loads configuration from:
//! 1. `~/.tributary/config.toml` (global)
//! 2. `.tributary/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lock: LockSettings,
    pub stream: StreamSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock: LockSettings::default(),
            stream: StreamSettings::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.tributary/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (.tributary/config.toml) - overrides global
        let project_path = Path::new(".tributary/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.tributary/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".tributary/config.toml"))
    }

    /// Merge another config (project overrides)
    fn merge(&mut self, other: Config) {
        // Section-level replace; per-field merging is not worth it at this size
        let defaults = Config::default();
        if other.lock.default_wait_ms != defaults.lock.default_wait_ms {
            self.lock.default_wait_ms = other.lock.default_wait_ms;
        }
        if other.stream.initial_buffer_capacity != defaults.stream.initial_buffer_capacity {
            self.stream.initial_buffer_capacity = other.stream.initial_buffer_capacity;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("TRIB_DEFAULT_WAIT_MS") {
            if let Ok(n) = ms.parse() {
                self.lock.default_wait_ms = n;
            }
        }
        if let Ok(cap) = std::env::var("TRIB_STREAM_BUFFER") {
            if let Ok(n) = cap.parse() {
                self.stream.initial_buffer_capacity = n;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap()
    }
}

/// Lock acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Default bounded wait for lock acquisition, in milliseconds
    pub default_wait_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_wait_ms: 30_000,
        }
    }
}

impl LockSettings {
    /// Default bounded wait as a `Duration`
    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.default_wait_ms)
    }
}

/// Joinable stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Initial capacity reserved for a joinable stream buffer, in bytes
    pub initial_buffer_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            initial_buffer_capacity: 64 * 1024,
        }
    }
}
