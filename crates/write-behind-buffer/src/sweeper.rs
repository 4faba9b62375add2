//! Periodic recovery: retry rollover and stuck-message redrive.

use crate::config::BufferConfig;
use crate::error::BufferResult;
use crate::strategy::BufferStrategy;
use crate::worker::RunningGuard;
use async_trait::async_trait;
use shutdown_coordinator::Stoppable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired INFLIGHT ids found.
    pub found: usize,
    /// Returned to MAIN.
    pub redriven: usize,
    /// Acked or nacked between the scan and the redrive.
    pub skipped: usize,
}

pub struct RecoverySweeper<T> {
    buffer: Arc<dyn BufferStrategy<T>>,
    retry_interval: Duration,
    redrive_interval: Duration,
    inflight_timeout: Duration,
    batch_size: usize,
    priority: i32,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl<T> RecoverySweeper<T>
where
    T: Send + 'static,
{
    pub fn new(buffer: Arc<dyn BufferStrategy<T>>, config: &BufferConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            buffer,
            retry_interval: config.retry_sweep_interval(),
            redrive_interval: config.redrive_sweep_interval(),
            inflight_timeout: config.inflight_timeout(),
            batch_size: config.recovery_batch_size,
            priority: 300,
            running: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Move due RETRY entries back to MAIN.
    pub async fn sweep_retries(&self) -> BufferResult<usize> {
        let moved = self.buffer.process_retry_rollover(self.batch_size).await?;
        if moved > 0 {
            info!(count = moved, "Retry rollover moved messages to main queue");
        }
        Ok(moved)
    }

    /// Redrive INFLIGHT entries older than the inflight timeout.
    pub async fn sweep_expired(&self) -> BufferResult<SweepReport> {
        let expired = self
            .buffer
            .expired_inflight(self.inflight_timeout, self.batch_size)
            .await?;
        let mut report = SweepReport {
            found: expired.len(),
            ..Default::default()
        };
        for id in &expired {
            if self.buffer.redrive(id).await? {
                report.redriven += 1;
            } else {
                report.skipped += 1;
            }
        }
        if report.found > 0 {
            info!(
                found = report.found,
                redriven = report.redriven,
                skipped = report.skipped,
                "Redrive sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn run(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let _running = RunningGuard::set(&self.running);

        let mut retry_tick = tokio::time::interval(self.retry_interval);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut redrive_tick = tokio::time::interval(self.redrive_interval);
        redrive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            retry_interval_ms = self.retry_interval.as_millis() as u64,
            redrive_interval_ms = self.redrive_interval.as_millis() as u64,
            "Recovery sweeper started"
        );

        while !*stop_rx.borrow() {
            tokio::select! {
                _ = retry_tick.tick() => {
                    if let Err(e) = self.sweep_retries().await {
                        warn!(error = %e, "Retry rollover failed");
                    }
                }
                _ = redrive_tick.tick() => {
                    if let Err(e) = self.sweep_expired().await {
                        warn!(error = %e, "Redrive sweep failed");
                    }
                }
                _ = stop_rx.changed() => {
                    debug!("Recovery sweeper received stop");
                }
            }
        }

        info!("Recovery sweeper stopped");
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move { self.run().await })
    }
}

#[async_trait]
impl<T> Stoppable for RecoverySweeper<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        "recovery-sweeper"
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
