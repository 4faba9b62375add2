//! # Write-Behind Buffer
//!
//! Decouples request-path producers from a slow persistence store. Producers
//! `offer` messages and return immediately; background consumers `consume`
//! batches, persist them, and `ack` or `nack` each message. Nothing accepted
//! is lost: every message ends acknowledged, parked in the retry set, or in
//! the dead-letter set.
//!
//! Two engines implement [`BufferStrategy`]:
//!
//! - [`InMemoryBuffer`]: single process, lock-free main queue, atomic
//!   capacity accounting, quiescence barrier for shutdown.
//! - [`DistributedBuffer`]: shared Redis state, one Lua script per state
//!   transition so every move is atomic on the server.
//!
//! ## Message lifecycle
//!
//! ```text
//! offer ──► MAIN ──consume──► INFLIGHT ──ack──► (gone)
//!            ▲                  │  │
//!            │          nack<max│  │nack>=max
//!            │                  ▼  ▼
//!            └──rollover──── RETRY  DEAD ──► dead-letter escalation
//!            └──redrive (stuck INFLIGHT)
//! ```
//!
//! Around the engines sit the consumer [`BufferWorker`], the
//! [`RecoverySweeper`] for retry rollover and stuck-message redrive, the
//! [`ShutdownDrain`] that flushes the buffer on exit, and the
//! [`DeadLetterHandler`] safety net.

pub mod barrier;
pub mod config;
pub mod dead_letter;
pub mod distributed;
pub mod drain;
pub mod error;
pub mod keys;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod redis_store;
pub mod scripts;
pub mod store;
pub mod strategy;
pub mod sweeper;
pub mod worker;

#[cfg(test)]
mod tests;

pub use barrier::{BarrierGuard, QuiescenceBarrier};
pub use config::{BufferConfig, RetryPolicy};
pub use dead_letter::{
    AlertSink, DeadLetter, DeadLetterError, DeadLetterHandler, DeadLetterStore, Escalation,
    FileBackup, TracingAlertSink,
};
pub use distributed::DistributedBuffer;
pub use drain::{DrainReport, ShutdownDrain};
pub use error::{BufferError, BufferResult};
pub use keys::BufferKeys;
pub use memory::InMemoryBuffer;
pub use message::{Envelope, Message, MessageId, QueueSet};
pub use metrics::{BufferCounter, BufferGauge, MetricsSink, NoopMetrics, PrometheusMetrics};
pub use redis_store::RedisQueueStore;
pub use store::{CheckedOut, QueueStore};
pub use strategy::{BufferStrategy, NackOutcome, Offer, QueueCounts, RejectReason, StrategyKind};
pub use sweeper::{RecoverySweeper, SweepReport};
pub use worker::{BatchPersister, BufferWorker, PersistError, WorkerReport};
