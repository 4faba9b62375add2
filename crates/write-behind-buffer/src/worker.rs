//! Background consumer: consume, persist, then ack or nack.

use crate::dead_letter::DeadLetterHandler;
use crate::error::BufferResult;
use crate::message::Message;
use crate::metrics::{BufferCounter, MetricsSink};
use crate::strategy::{BufferStrategy, NackOutcome};
use async_trait::async_trait;
use serde::Serialize;
use shutdown_coordinator::Stoppable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Clears a running flag when dropped, including on unwind.
pub(crate) struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    pub(crate) fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Failure reported by the downstream store.
#[derive(Error, Debug, Clone)]
pub enum PersistError {
    /// Worth retrying later (timeouts, lock contention, store restarting).
    #[error("Transient persistence failure: {0}")]
    Transient(String),

    /// Will never succeed for this batch (constraint violation, bad data).
    #[error("Unrecoverable persistence failure: {0}")]
    Unrecoverable(String),
}

/// The store that finally persists confirmed results.
#[async_trait]
pub trait BatchPersister<T>: Send + Sync {
    async fn persist(&self, batch: &[Message<T>]) -> Result<(), PersistError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub consumed: usize,
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

pub struct BufferWorker<T> {
    buffer: Arc<dyn BufferStrategy<T>>,
    persister: Arc<dyn BatchPersister<T>>,
    dead_letters: Arc<DeadLetterHandler>,
    metrics: Arc<dyn MetricsSink>,
    batch_size: usize,
    idle_delay: Duration,
    priority: i32,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl<T> BufferWorker<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(
        buffer: Arc<dyn BufferStrategy<T>>,
        persister: Arc<dyn BatchPersister<T>>,
        dead_letters: Arc<DeadLetterHandler>,
        metrics: Arc<dyn MetricsSink>,
        batch_size: usize,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            buffer,
            persister,
            dead_letters,
            metrics,
            batch_size,
            idle_delay: Duration::from_millis(100),
            priority: 200,
            running: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Pause between polls when MAIN is empty or the buffer errored.
    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Process one batch.
    pub async fn run_once(&self) -> BufferResult<WorkerReport> {
        let batch = self.buffer.consume(self.batch_size).await?;
        let mut report = WorkerReport {
            consumed: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        match self.persister.persist(&batch).await {
            Ok(()) => {
                for message in &batch {
                    if self.buffer.ack(&message.id).await? {
                        report.acked += 1;
                    }
                }
                debug!(count = report.acked, "Persisted and acked batch");
            }
            Err(PersistError::Transient(cause)) => {
                self.metrics.increment(BufferCounter::PersistFailed, 1);
                warn!(count = batch.len(), error = %cause, "Batch persist failed, nacking");
                for message in &batch {
                    match self.buffer.nack(&message.id, message.retry_count).await? {
                        NackOutcome::Retry { .. } => report.retried += 1,
                        NackOutcome::Dead { retry_count } => {
                            let dead = as_dead(message, retry_count);
                            self.dead_letters
                                .handle_message(&dead, &format!("retries exhausted: {}", cause))
                                .await;
                            report.dead_lettered += 1;
                        }
                        NackOutcome::NotFound => {}
                    }
                }
            }
            Err(PersistError::Unrecoverable(cause)) => {
                self.metrics.increment(BufferCounter::PersistFailed, 1);
                error!(count = batch.len(), error = %cause, "Batch persist failed permanently");
                let ceiling = self.buffer.max_retries();
                for message in &batch {
                    // Nacking at the ceiling sends the message straight to DEAD.
                    let current = message.retry_count.max(ceiling);
                    if let NackOutcome::Dead { retry_count } =
                        self.buffer.nack(&message.id, current).await?
                    {
                        let dead = as_dead(message, retry_count);
                        self.dead_letters
                            .handle_message(&dead, &format!("unrecoverable: {}", cause))
                            .await;
                        report.dead_lettered += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Loop until stopped. The batch in progress always completes.
    pub async fn run(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let _running = RunningGuard::set(&self.running);
        info!(batch_size = self.batch_size, "Buffer worker started");

        while !*stop_rx.borrow() {
            let idle = match self.run_once().await {
                Ok(report) => report.consumed == 0,
                Err(e) => {
                    warn!(error = %e, retryable = e.is_retryable(), "Buffer worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_delay) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        }

        info!("Buffer worker stopped");
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        // Mark running before the task is scheduled so an immediate
        // shutdown still waits for it.
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move { self.run().await })
    }
}

/// Borrowed view of a message carrying its final retry count, so
/// escalation records what was actually stored.
pub(crate) fn as_dead<T>(message: &Message<T>, retry_count: u32) -> Message<&T> {
    Message {
        id: message.id.clone(),
        key: message.key.clone(),
        payload: &message.payload,
        retry_count,
        created_at: message.created_at,
    }
}

#[async_trait]
impl<T> Stoppable for BufferWorker<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "buffer-worker"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
