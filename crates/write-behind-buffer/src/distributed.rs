//! Distributed engine over a [`QueueStore`].
//!
//! All cross-structure moves happen inside the store's atomic transitions.
//! This layer adds typing, the retry-versus-dead decision, backoff, the
//! local shutdown flag and quiescence barrier, and poison-message handling:
//! a checked-out id whose envelope is missing or does not decode is moved
//! straight to DEAD instead of being handed to the consumer.

use crate::barrier::QuiescenceBarrier;
use crate::config::{deadline_after, duration_ms, BufferConfig, RetryPolicy};
use crate::error::{BufferError, BufferResult};
use crate::message::{Envelope, Message, MessageId};
use crate::metrics::{report_counts, BufferCounter, MetricsSink};
use crate::redis_store::RedisQueueStore;
use crate::store::{CheckedOut, QueueStore};
use crate::strategy::{BufferStrategy, NackOutcome, Offer, QueueCounts, RejectReason, StrategyKind};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct DistributedBuffer<T, S = RedisQueueStore> {
    store: S,
    capacity: usize,
    policy: RetryPolicy,
    shutting_down: AtomicBool,
    barrier: QuiescenceBarrier,
    metrics: Arc<dyn MetricsSink>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> DistributedBuffer<T, RedisQueueStore>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Connect to Redis using `config.namespace` for the key layout.
    pub async fn connect(
        redis_url: &str,
        config: &BufferConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> BufferResult<Self> {
        let store = RedisQueueStore::connect(redis_url, &config.namespace).await?;
        Ok(Self::new(store, config, metrics))
    }
}

impl<T, S> DistributedBuffer<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: QueueStore,
{
    pub fn new(store: S, config: &BufferConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            capacity: config.max_capacity,
            policy: config.retry_policy(),
            shutting_down: AtomicBool::new(false),
            barrier: QuiescenceBarrier::new(),
            metrics,
            _payload: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn decode(&self, entry: &CheckedOut) -> BufferResult<Message<T>> {
        let raw = entry
            .envelope
            .as_deref()
            .ok_or_else(|| BufferError::Protocol("payload missing".into()))?;
        Envelope::decode(raw)?.into_message(MessageId::from(entry.id.as_str()))
    }

    /// Park an undeliverable checkout in DEAD.
    async fn quarantine(&self, entry: &CheckedOut, cause: &BufferError) -> BufferResult<()> {
        let retry_count = entry
            .envelope
            .as_deref()
            .and_then(|raw| Envelope::decode(raw).ok())
            .map(|env| env.retry_count)
            .unwrap_or(0);
        self.store.nack_to_dead(&entry.id, retry_count).await?;
        self.metrics.increment(BufferCounter::CorruptPayload, 1);
        error!(
            message_id = %entry.id,
            error = %cause,
            "Undecodable message moved to dead letters"
        );
        Ok(())
    }
}

#[async_trait]
impl<T, S> BufferStrategy<T> for DistributedBuffer<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: QueueStore,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::Distributed
    }

    async fn offer_batch(&self, key: &str, payloads: Vec<T>) -> BufferResult<Offer<Vec<MessageId>>> {
        let _guard = self.barrier.enter();
        if self.shutting_down.load(Ordering::SeqCst) {
            self.metrics
                .increment(BufferCounter::RejectedShutdown, payloads.len() as u64);
            return Ok(Offer::Rejected(RejectReason::ShuttingDown));
        }
        if payloads.is_empty() {
            return Ok(Offer::Accepted(Vec::new()));
        }

        let n = payloads.len();
        let mut ids = Vec::with_capacity(n);
        let mut entries = Vec::with_capacity(n);
        for payload in payloads {
            let message = Message::new(key, payload);
            let envelope = Envelope::from_message(&message)?.encode()?;
            entries.push((message.id.as_str().to_string(), envelope));
            ids.push(message.id);
        }

        if !self.store.publish(&entries, self.capacity).await? {
            self.metrics
                .increment(BufferCounter::RejectedBackpressure, n as u64);
            debug!(count = n, capacity = self.capacity, "Offer rejected by backpressure");
            return Ok(Offer::Rejected(RejectReason::Backpressure));
        }

        self.metrics.increment(BufferCounter::Published, n as u64);
        Ok(Offer::Accepted(ids))
    }

    async fn consume(&self, max: usize) -> BufferResult<Vec<Message<T>>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let checked_out = self
            .store
            .consume(max, Utc::now().timestamp_millis())
            .await?;

        let mut batch = Vec::with_capacity(checked_out.len());
        for entry in &checked_out {
            match self.decode(entry) {
                Ok(message) => batch.push(message),
                Err(e) => self.quarantine(entry, &e).await?,
            }
        }
        if !batch.is_empty() {
            self.metrics
                .increment(BufferCounter::Consumed, batch.len() as u64);
        }
        Ok(batch)
    }

    async fn ack(&self, id: &MessageId) -> BufferResult<bool> {
        let removed = self.store.ack(id.as_str()).await?;
        if removed {
            self.metrics.increment(BufferCounter::Acked, 1);
        } else {
            self.metrics.increment(BufferCounter::AckNotFound, 1);
            debug!(message_id = %id, "Ack for message not in flight");
        }
        Ok(removed)
    }

    async fn nack(&self, id: &MessageId, current_retry_count: u32) -> BufferResult<NackOutcome> {
        let retry_count = current_retry_count.saturating_add(1);

        if self.policy.is_exhausted(current_retry_count) {
            if !self.store.nack_to_dead(id.as_str(), retry_count).await? {
                self.metrics.increment(BufferCounter::NackNotFound, 1);
                return Ok(NackOutcome::NotFound);
            }
            self.metrics.increment(BufferCounter::NackDead, 1);
            warn!(message_id = %id, retry_count, "Message moved to dead letters");
            return Ok(NackOutcome::Dead { retry_count });
        }

        let delay = self.policy.backoff(current_retry_count);
        let next_attempt_at = deadline_after(Utc::now(), delay);
        if !self
            .store
            .nack_to_retry(id.as_str(), retry_count, next_attempt_at.timestamp_millis())
            .await?
        {
            self.metrics.increment(BufferCounter::NackNotFound, 1);
            return Ok(NackOutcome::NotFound);
        }
        self.metrics.increment(BufferCounter::NackRetry, 1);
        debug!(
            message_id = %id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Message scheduled for retry"
        );
        Ok(NackOutcome::Retry {
            retry_count,
            next_attempt_at,
        })
    }

    async fn redrive(&self, id: &MessageId) -> BufferResult<bool> {
        let moved = self.store.redrive(id.as_str()).await?;
        if moved {
            self.metrics.increment(BufferCounter::Redriven, 1);
            info!(message_id = %id, "Redrove stuck message");
        } else {
            self.metrics.increment(BufferCounter::RedriveSkipped, 1);
            debug!(message_id = %id, "Redrive skipped, message no longer in flight");
        }
        Ok(moved)
    }

    async fn process_retry_rollover(&self, limit: usize) -> BufferResult<usize> {
        let moved = self
            .store
            .rollover(Utc::now().timestamp_millis(), limit)
            .await?;
        if moved > 0 {
            self.metrics
                .increment(BufferCounter::RetryRolledOver, moved as u64);
            debug!(count = moved, "Rolled retry entries back to main queue");
        }
        Ok(moved)
    }

    async fn expired_inflight(&self, timeout: Duration, limit: usize) -> BufferResult<Vec<MessageId>> {
        let cutoff = Utc::now().timestamp_millis().saturating_sub(duration_ms(timeout));
        let ids = self.store.expired_inflight(cutoff, limit).await?;
        Ok(ids.into_iter().map(MessageId::from).collect())
    }

    async fn poll_dead_letters(&self, max: usize) -> BufferResult<Vec<Message<T>>> {
        let polled = self.store.poll_dead(max).await?;
        let mut messages = Vec::with_capacity(polled.len());
        for entry in polled {
            match self.decode(&entry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    // Already popped; the raw envelope goes to the log so it
                    // can still be recovered by hand.
                    self.metrics.increment(BufferCounter::CorruptPayload, 1);
                    error!(
                        message_id = %entry.id,
                        envelope = entry.envelope.as_deref().unwrap_or(""),
                        error = %e,
                        "Dropped undecodable dead letter"
                    );
                }
            }
        }
        if !messages.is_empty() {
            self.metrics
                .increment(BufferCounter::DeadLetterPolled, messages.len() as u64);
        }
        Ok(messages)
    }

    async fn is_healthy(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Buffer store health check failed");
                false
            }
        }
    }

    fn prepare_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!(active_offers = self.barrier.active(), "Buffer stopped accepting offers");
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn await_pending_offers(&self, timeout: Duration) -> bool {
        let drained = self.barrier.wait_idle(timeout).await;
        if !drained {
            warn!(
                active_offers = self.barrier.active(),
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting for in-progress offers"
            );
        }
        drained
    }

    fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    async fn counts(&self) -> BufferResult<QueueCounts> {
        let counts = self.store.counts().await?;
        report_counts(self.metrics.as_ref(), &counts);
        Ok(counts)
    }
}
