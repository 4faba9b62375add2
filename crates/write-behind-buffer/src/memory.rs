//! In-process engine.
//!
//! MAIN is a lock-free [`SegQueue`]. Capacity is a single atomic counter of
//! live messages (MAIN + INFLIGHT + RETRY): an offer speculatively adds its
//! batch size and subtracts it back if the ceiling was crossed, so accounting
//! stays exact under contention without a lock. INFLIGHT and RETRY sit
//! behind short `parking_lot` critical sections; every transition between
//! them is a single removal under one lock, which is what makes `ack` and
//! `redrive` mutually exclusive.

use crate::barrier::QuiescenceBarrier;
use crate::config::{deadline_after, duration_ms, BufferConfig, RetryPolicy};
use crate::error::BufferResult;
use crate::message::{Message, MessageId};
use crate::metrics::{report_counts, BufferCounter, MetricsSink};
use crate::strategy::{BufferStrategy, NackOutcome, Offer, QueueCounts, RejectReason, StrategyKind};
use async_trait::async_trait;
use chrono::Utc;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

struct Checkout<T> {
    message: Message<T>,
    checked_out_ms: i64,
}

pub struct InMemoryBuffer<T> {
    main: SegQueue<Message<T>>,
    inflight: Mutex<HashMap<MessageId, Checkout<T>>>,
    /// Keyed by (next attempt ms, insertion sequence).
    retry: Mutex<BTreeMap<(i64, u64), Message<T>>>,
    dead: SegQueue<Message<T>>,
    reserved: AtomicUsize,
    capacity: usize,
    policy: RetryPolicy,
    retry_seq: AtomicU64,
    shutting_down: AtomicBool,
    barrier: QuiescenceBarrier,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> InMemoryBuffer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: &BufferConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            main: SegQueue::new(),
            inflight: Mutex::new(HashMap::new()),
            retry: Mutex::new(BTreeMap::new()),
            dead: SegQueue::new(),
            reserved: AtomicUsize::new(0),
            capacity: config.max_capacity,
            policy: config.retry_policy(),
            retry_seq: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            barrier: QuiescenceBarrier::new(),
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live messages currently counted against capacity.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Pop up to `max` messages from MAIN and release their capacity. There
    /// is no ack step: a drained message is the caller's responsibility.
    pub fn drain(&self, max: usize) -> Vec<Message<T>> {
        let mut drained = Vec::with_capacity(max.min(self.main.len()));
        while drained.len() < max {
            match self.main.pop() {
                Some(message) => drained.push(message),
                None => break,
            }
        }
        if !drained.is_empty() {
            self.release(drained.len());
            self.metrics
                .increment(BufferCounter::Consumed, drained.len() as u64);
            debug!(count = drained.len(), "Drained messages");
        }
        drained
    }

    /// Reserve `n` slots, rolling back if the ceiling is crossed.
    fn try_reserve(&self, n: usize) -> bool {
        let previous = self.reserved.fetch_add(n, Ordering::SeqCst);
        if previous + n > self.capacity {
            self.reserved.fetch_sub(n, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn release(&self, n: usize) {
        self.reserved.fetch_sub(n, Ordering::SeqCst);
    }

    fn take_inflight(&self, id: &MessageId) -> Option<Checkout<T>> {
        self.inflight.lock().remove(id)
    }
}

#[async_trait]
impl<T> BufferStrategy<T> for InMemoryBuffer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::InMemory
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
        if !self.try_reserve(n) {
            self.metrics
                .increment(BufferCounter::RejectedBackpressure, n as u64);
            debug!(count = n, capacity = self.capacity, "Offer rejected by backpressure");
            return Ok(Offer::Rejected(RejectReason::Backpressure));
        }

        let mut ids = Vec::with_capacity(n);
        for payload in payloads {
            let message = Message::new(key, payload);
            ids.push(message.id.clone());
            self.main.push(message);
        }
        self.metrics.increment(BufferCounter::Published, n as u64);
        Ok(Offer::Accepted(ids))
    }

    async fn consume(&self, max: usize) -> BufferResult<Vec<Message<T>>> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.main.pop() {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        if batch.is_empty() {
            return Ok(batch);
        }

        let now = Utc::now().timestamp_millis();
        {
            let mut inflight = self.inflight.lock();
            for message in &batch {
                inflight.insert(
                    message.id.clone(),
                    Checkout {
                        message: message.clone(),
                        checked_out_ms: now,
                    },
                );
            }
        }
        self.metrics
            .increment(BufferCounter::Consumed, batch.len() as u64);
        Ok(batch)
    }

    async fn ack(&self, id: &MessageId) -> BufferResult<bool> {
        if self.take_inflight(id).is_some() {
            self.release(1);
            self.metrics.increment(BufferCounter::Acked, 1);
            Ok(true)
        } else {
            self.metrics.increment(BufferCounter::AckNotFound, 1);
            debug!(message_id = %id, "Ack for message not in flight");
            Ok(false)
        }
    }

    async fn nack(&self, id: &MessageId, current_retry_count: u32) -> BufferResult<NackOutcome> {
        let Some(checkout) = self.take_inflight(id) else {
            self.metrics.increment(BufferCounter::NackNotFound, 1);
            debug!(message_id = %id, "Nack for message not in flight");
            return Ok(NackOutcome::NotFound);
        };

        let retry_count = current_retry_count.saturating_add(1);
        let message = checkout.message.with_retry_count(retry_count);

        if self.policy.is_exhausted(current_retry_count) {
            self.dead.push(message);
            self.release(1);
            self.metrics.increment(BufferCounter::NackDead, 1);
            warn!(message_id = %id, retry_count, "Message moved to dead letters");
            return Ok(NackOutcome::Dead { retry_count });
        }

        let delay = self.policy.backoff(current_retry_count);
        let next_attempt_at = deadline_after(Utc::now(), delay);
        let seq = self.retry_seq.fetch_add(1, Ordering::Relaxed);
        self.retry
            .lock()
            .insert((next_attempt_at.timestamp_millis(), seq), message);
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
        match self.take_inflight(id) {
            Some(checkout) => {
                self.main.push(checkout.message);
                self.metrics.increment(BufferCounter::Redriven, 1);
                info!(message_id = %id, "Redrove stuck message");
                Ok(true)
            }
            None => {
                self.metrics.increment(BufferCounter::RedriveSkipped, 1);
                debug!(message_id = %id, "Redrive skipped, message no longer in flight");
                Ok(false)
            }
        }
    }

    async fn process_retry_rollover(&self, limit: usize) -> BufferResult<usize> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<Message<T>> = {
            let mut retry = self.retry.lock();
            let keys: Vec<(i64, u64)> = retry
                .range(..=(now, u64::MAX))
                .take(limit)
                .map(|(k, _)| *k)
                .collect();
            keys.iter().filter_map(|k| retry.remove(k)).collect()
        };
        let moved = due.len();
        for message in due {
            self.main.push(message);
        }
        if moved > 0 {
            self.metrics
                .increment(BufferCounter::RetryRolledOver, moved as u64);
            debug!(count = moved, "Rolled retry entries back to main queue");
        }
        Ok(moved)
    }

    async fn expired_inflight(&self, timeout: Duration, limit: usize) -> BufferResult<Vec<MessageId>> {
        let cutoff = Utc::now().timestamp_millis().saturating_sub(duration_ms(timeout));
        let mut expired: Vec<(i64, MessageId)> = self
            .inflight
            .lock()
            .iter()
            .filter(|(_, c)| c.checked_out_ms <= cutoff)
            .map(|(id, c)| (c.checked_out_ms, id.clone()))
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn poll_dead_letters(&self, max: usize) -> BufferResult<Vec<Message<T>>> {
        let mut polled = Vec::new();
        while polled.len() < max {
            match self.dead.pop() {
                Some(message) => polled.push(message),
                None => break,
            }
        }
        if !polled.is_empty() {
            self.metrics
                .increment(BufferCounter::DeadLetterPolled, polled.len() as u64);
        }
        Ok(polled)
    }

    async fn is_healthy(&self) -> bool {
        true
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
        let counts = QueueCounts {
            pending: self.main.len(),
            inflight: self.inflight.lock().len(),
            retry: self.retry.lock().len(),
            dead: self.dead.len(),
        };
        report_counts(self.metrics.as_ref(), &counts);
        Ok(counts)
    }
}
