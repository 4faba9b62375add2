//! Test harness for buffer scenario tests.
//!
//! Provides:
//! - MockQueueStore: an in-memory `QueueStore` with the same transitions as
//!   the Lua scripts, plus latency and failure injection
//! - Job: the payload type used throughout
//! - engines(): one instance of each engine behind `BufferStrategy`
//! - RecordingPersister, MemoryDeadLetterStore, FailingDeadLetterStore,
//!   RecordingAlertSink

use crate::config::BufferConfig;
use crate::dead_letter::{AlertSink, DeadLetter, DeadLetterError, DeadLetterHandler, DeadLetterStore, FileBackup};
use crate::distributed::DistributedBuffer;
use crate::error::{BufferError, BufferResult};
use crate::memory::InMemoryBuffer;
use crate::message::{Envelope, Message};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::store::{CheckedOut, QueueStore};
use crate::strategy::{BufferStrategy, QueueCounts};
use crate::worker::{BatchPersister, PersistError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Payload used by every scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub n: u32,
}

pub fn job(n: u32) -> Job {
    Job { n }
}

/// Config with zero backoff so retries are due immediately.
pub fn config(capacity: usize, max_retries: u32) -> BufferConfig {
    BufferConfig {
        max_capacity: capacity,
        max_retries,
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        ..Default::default()
    }
}

pub type MockBuffer = DistributedBuffer<Job, MockQueueStore>;

pub fn memory(config: &BufferConfig) -> Arc<InMemoryBuffer<Job>> {
    Arc::new(InMemoryBuffer::new(config, Arc::new(NoopMetrics)))
}

pub fn distributed(config: &BufferConfig) -> Arc<MockBuffer> {
    Arc::new(DistributedBuffer::new(
        MockQueueStore::new(),
        config,
        Arc::new(NoopMetrics),
    ))
}

/// Both engines, labelled for assertion messages.
pub fn engines(config: &BufferConfig) -> Vec<(&'static str, Arc<dyn BufferStrategy<Job>>)> {
    vec![
        ("memory", memory(config) as Arc<dyn BufferStrategy<Job>>),
        ("distributed", distributed(config) as Arc<dyn BufferStrategy<Job>>),
    ]
}

// =========================================================================
// MockQueueStore
// =========================================================================

#[derive(Default)]
struct MockState {
    main: VecDeque<String>,
    inflight: Vec<String>,
    inflight_ts: HashMap<String, i64>,
    payload: HashMap<String, String>,
    retry: HashMap<String, i64>,
    dead: VecDeque<String>,
}

impl MockState {
    fn remove_inflight(&mut self, id: &str) -> bool {
        let before = self.inflight.len();
        self.inflight.retain(|i| i != id);
        if self.inflight.len() == before {
            return false;
        }
        self.inflight_ts.remove(id);
        true
    }

    fn rewrite_retry_count(&mut self, id: &str, retry_count: u32) {
        if let Some(raw) = self.payload.get(id) {
            if let Ok(mut envelope) = Envelope::decode(raw) {
                envelope.retry_count = retry_count;
                if let Ok(encoded) = envelope.encode() {
                    self.payload.insert(id.to_string(), encoded);
                }
            }
        }
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MockQueueStore {
    state: Arc<Mutex<MockState>>,
    failing: Arc<AtomicBool>,
    publish_delay_ms: Arc<AtomicU64>,
}

impl MockQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a retryable backend error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Simulated network latency for publish.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn corrupt_payload(&self, id: &str) {
        self.state
            .lock()
            .payload
            .insert(id.to_string(), "{not json".to_string());
    }

    pub fn remove_payload(&self, id: &str) {
        self.state.lock().payload.remove(id);
    }

    /// Pretend the checkout happened `age` ago.
    pub fn backdate_checkout(&self, id: &str, age: Duration) {
        let mut state = self.state.lock();
        if let Some(ts) = state.inflight_ts.get_mut(id) {
            *ts -= age.as_millis() as i64;
        }
    }

    pub fn stored_envelope(&self, id: &str) -> Option<Envelope> {
        self.state
            .lock()
            .payload
            .get(id)
            .and_then(|raw| Envelope::decode(raw).ok())
    }

    pub fn in_main(&self, id: &str) -> bool {
        self.state.lock().main.iter().any(|i| i == id)
    }

    pub fn in_retry(&self, id: &str) -> bool {
        self.state.lock().retry.contains_key(id)
    }

    pub fn in_dead(&self, id: &str) -> bool {
        self.state.lock().dead.iter().any(|i| i == id)
    }

    fn check(&self) -> BufferResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BufferError::Backend("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MockQueueStore {
    async fn publish(&self, entries: &[(String, String)], capacity: usize) -> BufferResult<bool> {
        let delay = self.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check()?;
        let mut state = self.state.lock();
        let live = state.main.len() + state.inflight.len() + state.retry.len();
        if live + entries.len() > capacity {
            return Ok(false);
        }
        for (id, envelope) in entries {
            state.payload.insert(id.clone(), envelope.clone());
            state.main.push_back(id.clone());
        }
        Ok(true)
    }

    async fn consume(&self, max: usize, now_ms: i64) -> BufferResult<Vec<CheckedOut>> {
        self.check()?;
        let mut state = self.state.lock();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(id) = state.main.pop_front() else {
                break;
            };
            state.inflight.push(id.clone());
            state.inflight_ts.insert(id.clone(), now_ms);
            let envelope = state.payload.get(&id).cloned();
            out.push(CheckedOut { id, envelope });
        }
        Ok(out)
    }

    async fn ack(&self, id: &str) -> BufferResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.remove_inflight(id) {
            return Ok(false);
        }
        state.payload.remove(id);
        Ok(true)
    }

    async fn nack_to_retry(&self, id: &str, retry_count: u32, next_attempt_ms: i64) -> BufferResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.remove_inflight(id) {
            return Ok(false);
        }
        state.rewrite_retry_count(id, retry_count);
        state.retry.insert(id.to_string(), next_attempt_ms);
        Ok(true)
    }

    async fn nack_to_dead(&self, id: &str, retry_count: u32) -> BufferResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.remove_inflight(id) {
            return Ok(false);
        }
        state.rewrite_retry_count(id, retry_count);
        state.dead.push_back(id.to_string());
        Ok(true)
    }

    async fn redrive(&self, id: &str) -> BufferResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.remove_inflight(id) {
            return Ok(false);
        }
        state.main.push_back(id.to_string());
        Ok(true)
    }

    async fn rollover(&self, now_ms: i64, limit: usize) -> BufferResult<usize> {
        self.check()?;
        let mut state = self.state.lock();
        let mut due: Vec<(i64, String)> = state
            .retry
            .iter()
            .filter(|(_, score)| **score <= now_ms)
            .map(|(id, score)| (*score, id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);
        for (_, id) in &due {
            state.retry.remove(id);
            state.main.push_back(id.clone());
        }
        Ok(due.len())
    }

    async fn expired_inflight(&self, cutoff_ms: i64, limit: usize) -> BufferResult<Vec<String>> {
        self.check()?;
        let state = self.state.lock();
        let mut expired: Vec<(i64, String)> = state
            .inflight_ts
            .iter()
            .filter(|(_, ts)| **ts <= cutoff_ms)
            .map(|(id, ts)| (*ts, id.clone()))
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn poll_dead(&self, max: usize) -> BufferResult<Vec<CheckedOut>> {
        self.check()?;
        let mut state = self.state.lock();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(id) = state.dead.pop_front() else {
                break;
            };
            let envelope = state.payload.remove(&id);
            out.push(CheckedOut { id, envelope });
        }
        Ok(out)
    }

    async fn counts(&self) -> BufferResult<QueueCounts> {
        self.check()?;
        let state = self.state.lock();
        Ok(QueueCounts {
            pending: state.main.len(),
            inflight: state.inflight.len(),
            retry: state.retry.len(),
            dead: state.dead.len(),
        })
    }

    async fn ping(&self) -> BufferResult<()> {
        self.check()
    }
}

// =========================================================================
// Persisters
// =========================================================================

/// Scripted persister: pops one result per call, succeeding once the script
/// runs out. Records every successfully persisted payload.
#[derive(Default)]
pub struct RecordingPersister {
    script: Mutex<VecDeque<Result<(), PersistError>>>,
    persisted: Mutex<Vec<Job>>,
    calls: AtomicU64,
}

impl RecordingPersister {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_with(errors: Vec<PersistError>) -> Arc<Self> {
        let persister = Self::default();
        *persister.script.lock() = errors.into_iter().map(Err).collect();
        Arc::new(persister)
    }

    pub fn persisted(&self) -> Vec<Job> {
        self.persisted.lock().clone()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchPersister<Job> for RecordingPersister {
    async fn persist(&self, batch: &[Message<Job>]) -> Result<(), PersistError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.script.lock().pop_front() {
            result?;
        }
        self.persisted
            .lock()
            .extend(batch.iter().map(|m| m.payload.clone()));
        Ok(())
    }
}

// =========================================================================
// Dead-letter doubles
// =========================================================================

#[derive(Default)]
pub struct MemoryDeadLetterStore {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn insert(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        self.letters.lock().push(letter.clone());
        Ok(())
    }
}

pub struct FailingDeadLetterStore;

#[async_trait]
impl DeadLetterStore for FailingDeadLetterStore {
    async fn insert(&self, _letter: &DeadLetter) -> Result<(), DeadLetterError> {
        Err(DeadLetterError::Unavailable("database offline".into()))
    }
}

#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl RecordingAlertSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// (message id, cause, tier failures) per alert.
    pub fn alerts(&self) -> Vec<(String, String, Vec<String>)> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn critical(&self, letter: &DeadLetter, cause: &str, tier_failures: &[String]) {
        self.alerts.lock().push((
            letter.message_id.clone(),
            cause.to_string(),
            tier_failures.to_vec(),
        ));
    }
}

/// Handler backed by an in-memory store and a file backup under `dir`.
pub fn dead_letter_handler(
    dir: &Path,
    metrics: Arc<dyn MetricsSink>,
) -> (Arc<DeadLetterHandler>, Arc<MemoryDeadLetterStore>) {
    let store = MemoryDeadLetterStore::new();
    let handler = DeadLetterHandler::new(
        store.clone(),
        FileBackup::new(dir.join("dead-letters.jsonl")),
        RecordingAlertSink::new(),
        metrics,
    );
    (Arc::new(handler), store)
}
