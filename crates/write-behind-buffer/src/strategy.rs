//! The contract both engines implement.

use crate::error::{BufferError, BufferResult};
use crate::message::{Message, MessageId, QueueSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    InMemory,
    Distributed,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::InMemory => "memory",
            StrategyKind::Distributed => "redis",
        }
    }
}

/// Why an offer was turned away. Both are expected operating conditions;
/// callers fall back to a slower direct path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Capacity ceiling would be exceeded.
    Backpressure,
    /// `prepare_shutdown` has been called.
    ShuttingDown,
}

/// Result of an offer: accepted with the assigned id(s), or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Offer<I> {
    Accepted(I),
    Rejected(RejectReason),
}

impl<I> Offer<I> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Offer::Accepted(_))
    }

    pub fn accepted(self) -> Option<I> {
        match self {
            Offer::Accepted(ids) => Some(ids),
            Offer::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            Offer::Accepted(_) => None,
            Offer::Rejected(reason) => Some(*reason),
        }
    }
}

/// Where a nacked message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled for another attempt.
    Retry {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retries exhausted; parked in DEAD.
    Dead { retry_count: u32 },
    /// Not in INFLIGHT (already acked, nacked or redriven). Nothing changed.
    NotFound,
}

/// Set sizes for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub inflight: usize,
    pub retry: usize,
    pub dead: usize,
}

impl QueueCounts {
    /// Messages that still count against capacity.
    pub fn live(&self) -> usize {
        self.pending + self.inflight + self.retry
    }

    pub fn total(&self) -> usize {
        self.live() + self.dead
    }

    pub fn get(&self, set: QueueSet) -> usize {
        match set {
            QueueSet::Main => self.pending,
            QueueSet::Inflight => self.inflight,
            QueueSet::Retry => self.retry,
            QueueSet::Dead => self.dead,
        }
    }
}

/// Reliable-delivery buffer.
///
/// Every message is in exactly one of MAIN, INFLIGHT, RETRY or DEAD until
/// it is acked, and every move between sets happens in one indivisible step.
/// `ack` and `redrive` on the same id are mutually exclusive: whichever
/// observes the message in INFLIGHT first wins.
#[async_trait]
pub trait BufferStrategy<T>: Send + Sync
where
    T: Send + 'static,
{
    fn kind(&self) -> StrategyKind;

    /// Enqueue one payload. The message is visible to consumers once this
    /// returns `Accepted`.
    async fn offer(&self, key: &str, payload: T) -> BufferResult<Offer<MessageId>> {
        match self.offer_batch(key, vec![payload]).await? {
            Offer::Accepted(ids) => ids
                .into_iter()
                .next()
                .map(Offer::Accepted)
                .ok_or_else(|| BufferError::Protocol("batch offer returned no id".into())),
            Offer::Rejected(reason) => Ok(Offer::Rejected(reason)),
        }
    }

    /// Enqueue all payloads or none of them.
    async fn offer_batch(&self, key: &str, payloads: Vec<T>) -> BufferResult<Offer<Vec<MessageId>>>;

    /// Check out up to `max` messages from MAIN into INFLIGHT. An empty
    /// result is normal.
    async fn consume(&self, max: usize) -> BufferResult<Vec<Message<T>>>;

    /// Remove a message from INFLIGHT for good. Returns `false` when the id
    /// was not in flight; acking twice is harmless.
    async fn ack(&self, id: &MessageId) -> BufferResult<bool>;

    /// Record a failed attempt. The stored retry count becomes
    /// `current_retry_count + 1`; the message goes to RETRY, or to DEAD
    /// once `current_retry_count` reaches `max_retries`.
    async fn nack(&self, id: &MessageId, current_retry_count: u32) -> BufferResult<NackOutcome>;

    /// Return an abandoned INFLIGHT message to MAIN. Returns `false` if it
    /// was no longer in flight.
    async fn redrive(&self, id: &MessageId) -> BufferResult<bool>;

    /// Move up to `limit` due RETRY entries back to MAIN.
    async fn process_retry_rollover(&self, limit: usize) -> BufferResult<usize>;

    /// INFLIGHT ids checked out more than `timeout` ago, oldest first.
    async fn expired_inflight(&self, timeout: Duration, limit: usize) -> BufferResult<Vec<MessageId>>;

    /// Remove and return up to `max` messages from DEAD.
    async fn poll_dead_letters(&self, max: usize) -> BufferResult<Vec<Message<T>>>;

    async fn is_healthy(&self) -> bool;

    /// Stop admitting offers. Offers already admitted still complete.
    fn prepare_shutdown(&self);

    fn is_shutting_down(&self) -> bool;

    /// Wait until every admitted offer has finished. Returns `false` on
    /// timeout.
    async fn await_pending_offers(&self, timeout: Duration) -> bool;

    fn max_retries(&self) -> u32;

    async fn counts(&self) -> BufferResult<QueueCounts>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_accessors() {
        let accepted: Offer<u32> = Offer::Accepted(7);
        assert!(accepted.is_accepted());
        assert_eq!(accepted.rejection(), None);
        assert_eq!(accepted.accepted(), Some(7));

        let rejected: Offer<u32> = Offer::Rejected(RejectReason::Backpressure);
        assert!(!rejected.is_accepted());
        assert_eq!(rejected.rejection(), Some(RejectReason::Backpressure));
    }

    #[test]
    fn test_counts_live_excludes_dead() {
        let counts = QueueCounts {
            pending: 1,
            inflight: 2,
            retry: 3,
            dead: 4,
        };
        assert_eq!(counts.live(), 6);
        assert_eq!(counts.total(), 10);
        assert_eq!(counts.get(QueueSet::Retry), 3);
    }
}
