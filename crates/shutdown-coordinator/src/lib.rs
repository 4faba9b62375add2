//! # Shutdown Coordinator
//!
//! Stops registered components in ascending priority order. Each component
//! gets `stop()` called once, then is polled through `is_running()` until it
//! reports stopped or its timeout elapses. A component that times out or
//! panics is counted as a failure and the sequence moves on; shutdown never
//! aborts halfway.
//!
//! [`GracefulShutdownHook`] wraps the whole sequence in an outer deadline so
//! that a wedged component cannot hold process exit hostage.
//!
//! ```rust,ignore
//! let mut coordinator = ShutdownCoordinator::new(ShutdownConfig::default());
//! coordinator.register(drain.clone());
//! coordinator.register(sweeper.clone());
//!
//! let hook = GracefulShutdownHook::new(Arc::new(coordinator), Duration::from_secs(30));
//! hook.run().await;
//! ```

mod coordinator;
mod hook;
mod metrics;

pub use coordinator::{ComponentOutcome, ShutdownConfig, ShutdownCoordinator, ShutdownReport, StopStatus};
pub use hook::{GracefulShutdownHook, HookOutcome};
pub use metrics::ShutdownMetrics;

use async_trait::async_trait;
use std::time::Duration;

/// A long-running component that takes part in ordered shutdown.
#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Lower values stop first.
    fn priority(&self) -> i32;

    /// Begin stopping. May return before the component has fully stopped.
    async fn stop(&self);

    /// Whether the component is still running.
    fn is_running(&self) -> bool;

    /// Overrides the coordinator's per-component timeout.
    fn stop_timeout(&self) -> Option<Duration> {
        None
    }
}
