//! # Observability
//!
//! Logging setup shared by the buffer binaries.
//!
//! Services call [`init_with_config`] once at startup and use plain
//! `tracing` macros everywhere else. Events go to an append-only JSONL file
//! (`~/.unbound/logs/<service>.jsonl` unless overridden) and, optionally,
//! to a compact stderr stream.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "buffer-relay".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! });
//! ```
//!
//! `RUST_LOG` overrides `default_level` when set.

mod json_layer;
mod writer;

pub use json_layer::{JsonLayer, LogEntry};
pub use writer::LogFileWriter;

use std::io;
use std::path::PathBuf;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Where events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSONL file, plus stderr when `also_stderr` is set.
    #[default]
    Jsonl,
    /// Compact human-readable stderr only. For containers whose runtime
    /// already collects stderr.
    Compact,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Included in every JSONL line and used for the default file name.
    pub service_name: String,

    /// Filter directive used when `RUST_LOG` is unset.
    pub default_level: String,

    /// Defaults to `~/.unbound/logs/<service_name>.jsonl`.
    pub log_path: Option<PathBuf>,

    pub also_stderr: bool,

    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
            format: LogFormat::Jsonl,
        }
    }
}

impl LogConfig {
    /// Resolved JSONL path. Falls back to the temp dir without a home directory.
    pub fn resolved_log_path(&self) -> PathBuf {
        self.log_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".unbound").join("logs"))
                .unwrap_or_else(std::env::temp_dir)
                .join(format!("{}.jsonl", self.service_name))
        })
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }
}

/// Zero-config entry point.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Install the global subscriber. If the log file cannot be opened, logging
/// continues on stderr and the failure is reported there.
pub fn init_with_config(config: LogConfig) {
    if let Err(e) = try_init_with_config(&config) {
        let stderr_only = LogConfig {
            format: LogFormat::Compact,
            ..config.clone()
        };
        if try_init_with_config(&stderr_only).is_ok() {
            tracing::warn!(
                error = %e,
                log_path = %config.resolved_log_path().display(),
                "Log file unavailable, logging to stderr only"
            );
        }
    }
}

/// Like [`init_with_config`] but reports failures, including a subscriber
/// that is already installed.
pub fn try_init_with_config(config: &LogConfig) -> io::Result<()> {
    match config.format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(stderr_layer(config.env_filter()))
            .try_init()
            .map_err(io::Error::other),
        LogFormat::Jsonl => {
            let log_path = config.resolved_log_path();
            let writer = LogFileWriter::open(&log_path)?;
            let json_layer =
                JsonLayer::new(config.service_name.clone(), writer).with_filter(config.env_filter());
            let stderr = config
                .also_stderr
                .then(|| stderr_layer(config.env_filter()));

            tracing_subscriber::registry()
                .with(json_layer)
                .with(stderr)
                .try_init()
                .map_err(io::Error::other)?;

            tracing::debug!(log_path = %log_path.display(), "Logging initialized");
            Ok(())
        }
    }
}

fn stderr_layer<S>(filter: EnvFilter) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .compact()
        .with_writer(io::stderr)
        .with_filter(filter)
}

pub use tracing::{debug, error, info, instrument, trace, warn, Level};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "unknown");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(!config.also_stderr);
        assert_eq!(config.format, LogFormat::Jsonl);
    }

    #[test]
    fn test_default_path_uses_service_name() {
        let config = LogConfig {
            service_name: "buffer-relay".into(),
            ..Default::default()
        };
        let path = config.resolved_log_path();
        assert_eq!(path.file_name().unwrap(), "buffer-relay.jsonl");
    }

    #[test]
    fn test_explicit_path_wins() {
        let config = LogConfig {
            log_path: Some(PathBuf::from("/var/log/relay.jsonl")),
            ..Default::default()
        };
        assert_eq!(config.resolved_log_path(), PathBuf::from("/var/log/relay.jsonl"));
    }
}
