//! Dead-letter escalation: the triple safety net.
//!
//! When a message is dead-lettered the handler tries, strictly in order:
//!
//! 1. the durable [`DeadLetterStore`];
//! 2. if that fails, a local append-only JSONL [`FileBackup`];
//! 3. if both fail, a critical alert through the [`AlertSink`], carrying
//!    the original cause and both tier failures.
//!
//! Each tier has its own counter so operators can see how deep a failure
//! went. Re-queueing is never a fallback: a message that has already proven
//! unprocessable would loop forever.

use crate::message::Message;
use crate::metrics::{BufferCounter, MetricsSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// A dead-lettered message with its failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_message<T: Serialize>(
        message: &Message<T>,
        reason: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: message.id.to_string(),
            key: message.key.clone(),
            payload: serde_json::to_value(&message.payload)?,
            retry_count: message.retry_count,
            reason: reason.into(),
            created_at: message.created_at,
            failed_at: Utc::now(),
        })
    }
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("Dead-letter store unavailable: {0}")]
    Unavailable(String),

    #[error("Dead-letter store rejected record: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable dead-letter storage (tier 1).
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// Human-facing critical alert (tier 3). Must not fail silently.
pub trait AlertSink: Send + Sync {
    fn critical(&self, letter: &DeadLetter, cause: &str, tier_failures: &[String]);
}

/// Emits the alert as an `error` event for the log pipeline to page on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn critical(&self, letter: &DeadLetter, cause: &str, tier_failures: &[String]) {
        error!(
            alert = "dead_letter_unpersisted",
            message_id = %letter.message_id,
            key = %letter.key,
            retry_count = letter.retry_count,
            cause,
            tier_failures = ?tier_failures,
            payload = %letter.payload,
            "CRITICAL: dead letter could not be stored or backed up"
        );
    }
}

/// Append-only JSONL file, one [`DeadLetter`] per line (tier 2).
pub struct FileBackup {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `~/.unbound/buffer/dead-letters.jsonl`, or the working directory if
    /// there is no home directory.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".unbound")
            .join("buffer")
            .join("dead-letters.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(letter)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every record in the file, skipping lines that do not parse.
    pub async fn read_all(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

/// How far a dead letter had to fall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Stored,
    FileBackup,
    Alerted,
}

pub struct DeadLetterHandler {
    store: Arc<dyn DeadLetterStore>,
    backup: FileBackup,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl DeadLetterHandler {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        backup: FileBackup,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            backup,
            alerts,
            metrics,
        }
    }

    pub fn backup(&self) -> &FileBackup {
        &self.backup
    }

    /// Build a record from `message` and escalate it.
    pub async fn handle_message<T: Serialize>(&self, message: &Message<T>, cause: &str) -> Escalation {
        let letter = match DeadLetter::from_message(message, cause) {
            Ok(letter) => letter,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Dead letter payload not representable as JSON");
                DeadLetter {
                    message_id: message.id.to_string(),
                    key: message.key.clone(),
                    payload: serde_json::Value::Null,
                    retry_count: message.retry_count,
                    reason: format!("{} (payload unserializable: {})", cause, e),
                    created_at: message.created_at,
                    failed_at: Utc::now(),
                }
            }
        };
        self.handle(&letter).await
    }

    pub async fn handle(&self, letter: &DeadLetter) -> Escalation {
        let store_err = match self.store.insert(letter).await {
            Ok(()) => {
                self.metrics.increment(BufferCounter::DeadLetterStored, 1);
                info!(message_id = %letter.message_id, "Dead letter stored");
                return Escalation::Stored;
            }
            Err(e) => e,
        };
        warn!(
            message_id = %letter.message_id,
            error = %store_err,
            "Dead-letter store failed, falling back to file backup"
        );

        let backup_err = match self.backup.append(letter).await {
            Ok(()) => {
                self.metrics
                    .increment(BufferCounter::DeadLetterFileBackup, 1);
                warn!(
                    message_id = %letter.message_id,
                    path = %self.backup.path().display(),
                    "Dead letter written to file backup"
                );
                return Escalation::FileBackup;
            }
            Err(e) => e,
        };

        self.metrics.increment(BufferCounter::DeadLetterCritical, 1);
        self.alerts.critical(
            letter,
            &letter.reason,
            &[store_err.to_string(), backup_err.to_string()],
        );
        Escalation::Alerted
    }
}
