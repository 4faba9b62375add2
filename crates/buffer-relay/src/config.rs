//! Relay configuration: JSON file, then environment, then CLI flags.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use write_behind_buffer::BufferConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Default log level when `RUST_LOG` is unset
    pub log_level: String,

    /// JSONL file that `export-dead-letters` appends to when `--out` is not given
    pub dead_letter_path: Option<PathBuf>,

    /// Buffer settings, including the key namespace
    pub buffer: BufferConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            log_level: "info".to_string(),
            dead_letter_path: None,
            buffer: BufferConfig::default(),
        }
    }
}

impl RelayConfig {
    /// `~/.unbound/buffer/relay.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".unbound").join("buffer").join("relay.json"))
    }

    /// Load from `path` (which must exist) or from the default location when
    /// present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default) => Self::from_file(&default)?,
                None => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> RelayResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn apply_env(&mut self) {
        self.buffer.apply_env();
        self.apply_vars(|name| std::env::var(name).ok());
    }

    /// `REDIS_URL`, `RELAY_NAMESPACE`, `RELAY_LOG_LEVEL`, `RELAY_DEAD_LETTER_PATH`.
    pub fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(ns) = var("RELAY_NAMESPACE") {
            self.buffer.namespace = ns;
        }
        if let Some(level) = var("RELAY_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(path) = var("RELAY_DEAD_LETTER_PATH") {
            self.dead_letter_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.redis_url.is_empty() {
            return Err(RelayError::Config("redis_url must not be empty".into()));
        }
        self.buffer.validate()?;
        Ok(())
    }
}
