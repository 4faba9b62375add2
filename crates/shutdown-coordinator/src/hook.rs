//! Outer-deadline wrapper around the shutdown sequence.

use crate::coordinator::{ShutdownCoordinator, ShutdownReport};
use crate::metrics::ShutdownMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum HookOutcome {
    /// The coordinator finished before the deadline.
    Completed(ShutdownReport),
    /// The deadline expired; the coordinator task keeps running detached.
    TimedOut,
    /// The coordinator task itself panicked.
    Failed(String),
}

impl HookOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, HookOutcome::Completed(_))
    }
}

/// Runs a [`ShutdownCoordinator`] on a separate task and gives up waiting
/// once `deadline` passes, so process exit is never blocked indefinitely.
pub struct GracefulShutdownHook {
    coordinator: Arc<ShutdownCoordinator>,
    deadline: Duration,
    metrics: Option<ShutdownMetrics>,
}

impl GracefulShutdownHook {
    pub fn new(coordinator: Arc<ShutdownCoordinator>, deadline: Duration) -> Self {
        Self {
            coordinator,
            deadline,
            metrics: None,
        }
    }

    /// Uses the coordinator's configured `hook_deadline`.
    pub fn from_coordinator(coordinator: Arc<ShutdownCoordinator>) -> Self {
        let deadline = coordinator.config().hook_deadline;
        Self::new(coordinator, deadline)
    }

    pub fn with_metrics(mut self, metrics: ShutdownMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(&self) -> HookOutcome {
        info!(deadline_ms = self.deadline.as_millis() as u64, "Graceful shutdown initiated");

        let coordinator = self.coordinator.clone();
        let task = tokio::spawn(async move { coordinator.execute().await });

        let outcome = match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(report)) => {
                info!(
                    succeeded = report.succeeded(),
                    failed = report.failed(),
                    "Graceful shutdown completed"
                );
                HookOutcome::Completed(report)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Shutdown coordinator task failed");
                HookOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Graceful shutdown deadline exceeded, proceeding with exit"
                );
                HookOutcome::TimedOut
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_hook(match outcome {
                HookOutcome::Completed(_) => "success",
                HookOutcome::TimedOut => "timeout",
                HookOutcome::Failed(_) => "failure",
            });
        }

        outcome
    }
}
