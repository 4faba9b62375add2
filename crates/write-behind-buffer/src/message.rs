//! Message model shared by both engines.

use crate::error::BufferResult;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Unique message identifier (UUID v4, hyphenated).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A buffered message. `payload` is opaque to the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    pub id: MessageId,
    /// Routing or deduplication key supplied by the producer.
    pub key: String,
    pub payload: T,
    /// Number of failed delivery attempts so far.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl<T> Message<T> {
    pub fn new(key: impl Into<String>, payload: T) -> Self {
        Self {
            id: MessageId::new(),
            key: key.into(),
            payload,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Same message with its retry count rewritten.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Stored form of a message in the distributed payload hash.
///
/// Scripts only ever touch `retry_count`; `body` is the payload's JSON
/// text and stays opaque to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub key: String,
    pub body: String,
    pub retry_count: u32,
    pub created_at_ms: i64,
}

impl Envelope {
    pub fn from_message<T: Serialize>(message: &Message<T>) -> BufferResult<Self> {
        Ok(Self {
            key: message.key.clone(),
            body: serde_json::to_string(&message.payload)?,
            retry_count: message.retry_count,
            created_at_ms: message.created_at.timestamp_millis(),
        })
    }

    pub fn encode(&self) -> BufferResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> BufferResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn into_message<T: DeserializeOwned>(self, id: MessageId) -> BufferResult<Message<T>> {
        let payload = serde_json::from_str(&self.body)?;
        let created_at = Utc
            .timestamp_millis_opt(self.created_at_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(Message {
            id,
            key: self.key,
            payload,
            retry_count: self.retry_count,
            created_at,
        })
    }
}

/// The four buffer sets a live or dead message can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSet {
    Main,
    Inflight,
    Retry,
    Dead,
}

impl QueueSet {
    pub const ALL: [QueueSet; 4] = [QueueSet::Main, QueueSet::Inflight, QueueSet::Retry, QueueSet::Dead];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueSet::Main => "main",
            QueueSet::Inflight => "inflight",
            QueueSet::Retry => "retry",
            QueueSet::Dead => "dead",
        }
    }
}
