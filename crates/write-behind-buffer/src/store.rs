//! Atomic transition primitives for the distributed engine.
//!
//! One method per transition; each must commit as a single indivisible unit
//! on the backend. [`crate::RedisQueueStore`] backs them with Lua scripts.
//! Ids and envelopes are raw strings here; [`crate::DistributedBuffer`]
//! owns typing and policy.

use crate::error::BufferResult;
use crate::strategy::QueueCounts;
use async_trait::async_trait;

/// An id checked out of MAIN or DEAD with its stored envelope, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedOut {
    pub id: String,
    pub envelope: Option<String>,
}

/// Pairs a flat `[id, envelope, id, envelope, ...]` reply.
pub(crate) fn pair_flat_reply(flat: Vec<Option<String>>) -> Vec<CheckedOut> {
    let mut out = Vec::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let Some(id) = iter.next() {
        let envelope = iter.next().flatten();
        if let Some(id) = id {
            out.push(CheckedOut { id, envelope });
        }
    }
    out
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Store every envelope and push every id onto MAIN, or do nothing if
    /// live messages plus the batch would exceed `capacity`.
    async fn publish(&self, entries: &[(String, String)], capacity: usize) -> BufferResult<bool>;

    /// Move up to `max` ids from the head of MAIN to INFLIGHT, stamped `now_ms`.
    async fn consume(&self, max: usize, now_ms: i64) -> BufferResult<Vec<CheckedOut>>;

    /// Remove from INFLIGHT and delete the payload. `false` if not in flight.
    async fn ack(&self, id: &str) -> BufferResult<bool>;

    /// INFLIGHT to RETRY at `next_attempt_ms`, rewriting the retry count.
    async fn nack_to_retry(&self, id: &str, retry_count: u32, next_attempt_ms: i64) -> BufferResult<bool>;

    /// INFLIGHT to DEAD, rewriting the retry count.
    async fn nack_to_dead(&self, id: &str, retry_count: u32) -> BufferResult<bool>;

    /// INFLIGHT back to MAIN. `false` if not in flight.
    async fn redrive(&self, id: &str) -> BufferResult<bool>;

    /// Due RETRY entries to MAIN. Returns the number moved.
    async fn rollover(&self, now_ms: i64, limit: usize) -> BufferResult<usize>;

    /// INFLIGHT ids checked out at or before `cutoff_ms`, oldest first.
    async fn expired_inflight(&self, cutoff_ms: i64, limit: usize) -> BufferResult<Vec<String>>;

    /// Pop up to `max` DEAD entries together with their payloads.
    async fn poll_dead(&self, max: usize) -> BufferResult<Vec<CheckedOut>>;

    async fn counts(&self) -> BufferResult<QueueCounts>;

    async fn ping(&self) -> BufferResult<()>;
}
