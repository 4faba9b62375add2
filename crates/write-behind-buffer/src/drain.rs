//! Buffer shutdown: stop admissions, wait out admitted offers, flush.

use crate::config::BufferConfig;
use crate::dead_letter::DeadLetterHandler;
use crate::error::BufferResult;
use crate::strategy::{BufferStrategy, NackOutcome};
use crate::worker::{as_dead, BatchPersister};
use async_trait::async_trait;
use serde::Serialize;
use shutdown_coordinator::Stoppable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Three-phase buffer shutdown, run as a [`Stoppable`]:
///
/// 1. `prepare_shutdown`: new offers are rejected from here on.
/// 2. `await_pending_offers`: every offer that passed admission finishes.
/// 3. Flush MAIN through the persister until `empty_batch_retries`
///    consecutive consumes come back empty.
///
/// A batch that fails to persist during the flush is dead-lettered and
/// escalated immediately rather than scheduled for a retry that may never
/// run.
pub struct ShutdownDrain<T> {
    buffer: Arc<dyn BufferStrategy<T>>,
    persister: Arc<dyn BatchPersister<T>>,
    dead_letters: Arc<DeadLetterHandler>,
    batch_size: usize,
    await_timeout: Duration,
    empty_batch_retries: u32,
    empty_batch_delay: Duration,
    priority: i32,
    running: AtomicBool,
}

/// What the flush did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub offers_settled: bool,
    pub persisted: usize,
    pub dead_lettered: usize,
}

impl<T> ShutdownDrain<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(
        buffer: Arc<dyn BufferStrategy<T>>,
        persister: Arc<dyn BatchPersister<T>>,
        dead_letters: Arc<DeadLetterHandler>,
        config: &BufferConfig,
    ) -> Self {
        Self {
            buffer,
            persister,
            dead_letters,
            batch_size: config.batch_size,
            await_timeout: config.shutdown_await_timeout(),
            empty_batch_retries: 3,
            empty_batch_delay: Duration::from_millis(100),
            priority: 100,
            running: AtomicBool::new(true),
        }
    }

    pub fn with_empty_batch_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.empty_batch_retries = retries;
        self.empty_batch_delay = delay;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Run all three phases once.
    pub async fn drain(&self) -> BufferResult<DrainReport> {
        let mut report = DrainReport::default();

        self.buffer.prepare_shutdown();
        report.offers_settled = self.buffer.await_pending_offers(self.await_timeout).await;

        let mut empty_batches = 0;
        while empty_batches < self.empty_batch_retries {
            let batch = self.buffer.consume(self.batch_size).await?;
            if batch.is_empty() {
                empty_batches += 1;
                tokio::time::sleep(self.empty_batch_delay).await;
                continue;
            }
            empty_batches = 0;

            match self.persister.persist(&batch).await {
                Ok(()) => {
                    for message in &batch {
                        if self.buffer.ack(&message.id).await? {
                            report.persisted += 1;
                        }
                    }
                }
                Err(e) => {
                    error!(count = batch.len(), error = %e, "Persist failed during shutdown flush");
                    let ceiling = self.buffer.max_retries();
                    for message in &batch {
                        let current = message.retry_count.max(ceiling);
                        if let NackOutcome::Dead { retry_count } =
                            self.buffer.nack(&message.id, current).await?
                        {
                            self.dead_letters
                                .handle_message(
                                    &as_dead(message, retry_count),
                                    &format!("shutdown flush: {}", e),
                                )
                                .await;
                            report.dead_lettered += 1;
                        }
                    }
                }
            }
        }

        let remaining = self.buffer.counts().await?;
        if remaining.inflight > 0 || remaining.retry > 0 {
            warn!(
                inflight = remaining.inflight,
                retry = remaining.retry,
                "Messages still in flight or awaiting retry at shutdown"
            );
        }
        info!(
            persisted = report.persisted,
            dead_lettered = report.dead_lettered,
            offers_settled = report.offers_settled,
            "Buffer drained"
        );
        Ok(report)
    }
}

#[async_trait]
impl<T> Stoppable for ShutdownDrain<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "buffer-drain"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn stop(&self) {
        if let Err(e) = self.drain().await {
            error!(error = %e, "Buffer drain failed");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop_timeout(&self) -> Option<Duration> {
        // Waiting for offers alone may take the full await timeout.
        Some(self.await_timeout + Duration::from_secs(10))
    }
}
