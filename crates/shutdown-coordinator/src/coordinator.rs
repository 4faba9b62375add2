//! Priority-ordered component shutdown.

use crate::metrics::ShutdownMetrics;
use crate::Stoppable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shutdown timing configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Budget for a single component (stop call plus polling).
    pub component_timeout: Duration,

    /// How often `is_running()` is polled after `stop()` returns.
    pub poll_interval: Duration,

    /// Outer deadline used by [`crate::GracefulShutdownHook`].
    pub hook_deadline: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            component_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            hook_deadline: Duration::from_secs(30),
        }
    }
}

impl ShutdownConfig {
    /// Defaults overridden by `SHUTDOWN_COMPONENT_TIMEOUT_MS`,
    /// `SHUTDOWN_POLL_INTERVAL_MS` and `SHUTDOWN_HOOK_DEADLINE_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            component_timeout: env_millis("SHUTDOWN_COMPONENT_TIMEOUT_MS")
                .unwrap_or(defaults.component_timeout),
            poll_interval: env_millis("SHUTDOWN_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            hook_deadline: env_millis("SHUTDOWN_HOOK_DEADLINE_MS").unwrap_or(defaults.hook_deadline),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
}

/// How a single component's stop went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// Reported not running within its timeout.
    Stopped,
    /// Was not running when shutdown reached it; `stop()` was not called.
    AlreadyStopped,
    /// Still running (or still inside `stop()`) when the timeout elapsed.
    TimedOut,
    /// `stop()` panicked.
    Panicked,
}

impl StopStatus {
    pub fn is_success(self) -> bool {
        matches!(self, StopStatus::Stopped | StopStatus::AlreadyStopped)
    }

    fn as_label(self) -> &'static str {
        match self {
            StopStatus::Stopped => "success",
            StopStatus::AlreadyStopped => "skipped",
            StopStatus::TimedOut | StopStatus::Panicked => "failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComponentOutcome {
    pub name: String,
    pub priority: i32,
    pub status: StopStatus,
    pub elapsed: Duration,
}

/// Result of one shutdown sequence, in stop order.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub outcomes: Vec<ComponentOutcome>,
}

impl ShutdownReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}

/// Stops registered components one at a time, lowest priority first.
pub struct ShutdownCoordinator {
    components: Vec<Arc<dyn Stoppable>>,
    config: ShutdownConfig,
    metrics: Option<ShutdownMetrics>,
    executed: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            components: Vec::new(),
            config,
            metrics: None,
            executed: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: ShutdownMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register(&mut self, component: Arc<dyn Stoppable>) {
        debug!(
            component = component.name(),
            priority = component.priority(),
            "Registered shutdown component"
        );
        self.components.push(component);
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Run the shutdown sequence. Only the first call does any work; later
    /// calls return an empty report.
    pub async fn execute(&self) -> ShutdownReport {
        if self.executed.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already executed, ignoring");
            return ShutdownReport::default();
        }

        let mut ordered = self.components.clone();
        ordered.sort_by_key(|c| c.priority());

        info!(components = ordered.len(), "Starting ordered shutdown");

        let mut report = ShutdownReport::default();
        for component in ordered {
            let outcome = self.stop_component(component).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_phase(outcome.status.as_label());
            }
            report.outcomes.push(outcome);
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Ordered shutdown finished"
        );
        report
    }

    async fn stop_component(&self, component: Arc<dyn Stoppable>) -> ComponentOutcome {
        let name = component.name().to_string();
        let priority = component.priority();
        let started = Instant::now();

        if !component.is_running() {
            debug!(component = %name, "Component already stopped");
            return ComponentOutcome {
                name,
                priority,
                status: StopStatus::AlreadyStopped,
                elapsed: Duration::ZERO,
            };
        }

        let timeout = component
            .stop_timeout()
            .unwrap_or(self.config.component_timeout);
        let deadline = started + timeout;

        info!(component = %name, priority, timeout_ms = timeout.as_millis() as u64, "Stopping component");

        // Run stop() on its own task so a panic is contained.
        let stopper = component.clone();
        let task = tokio::spawn(async move { stopper.stop().await });

        let status = match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(())) => self.await_stopped(component.as_ref(), deadline).await,
            Ok(Err(e)) => {
                error!(component = %name, error = %e, "Component stop panicked");
                StopStatus::Panicked
            }
            Err(_) => StopStatus::TimedOut,
        };

        let elapsed = started.elapsed();
        match status {
            StopStatus::Stopped => {
                info!(component = %name, elapsed_ms = elapsed.as_millis() as u64, "Component stopped")
            }
            StopStatus::TimedOut => warn!(
                component = %name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Component did not stop within timeout"
            ),
            _ => {}
        }

        ComponentOutcome {
            name,
            priority,
            status,
            elapsed,
        }
    }

    async fn await_stopped(&self, component: &dyn Stoppable, deadline: Instant) -> StopStatus {
        loop {
            if !component.is_running() {
                return StopStatus::Stopped;
            }
            let now = Instant::now();
            if now >= deadline {
                return StopStatus::TimedOut;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}
