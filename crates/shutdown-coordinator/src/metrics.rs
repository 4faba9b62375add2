//! Prometheus counters for shutdown progress.

use prometheus::{IntCounterVec, Opts, Registry};

/// `shutdown_phase_total{status}` counts per-component results
/// (`success`, `failure`, `skipped`); `shutdown_hook_total{status}` counts
/// whole-sequence results (`success`, `timeout`, `failure`).
#[derive(Clone)]
pub struct ShutdownMetrics {
    phase_total: IntCounterVec,
    hook_total: IntCounterVec,
}

impl ShutdownMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let phase_total = IntCounterVec::new(
            Opts::new("shutdown_phase_total", "Component stop results during shutdown"),
            &["status"],
        )?;
        let hook_total = IntCounterVec::new(
            Opts::new("shutdown_hook_total", "Graceful shutdown hook results"),
            &["status"],
        )?;
        registry.register(Box::new(phase_total.clone()))?;
        registry.register(Box::new(hook_total.clone()))?;
        Ok(Self {
            phase_total,
            hook_total,
        })
    }

    pub(crate) fn record_phase(&self, status: &str) {
        self.phase_total.with_label_values(&[status]).inc();
    }

    pub(crate) fn record_hook(&self, status: &str) {
        self.hook_total.with_label_values(&[status]).inc();
    }

    pub fn phase_count(&self, status: &str) -> u64 {
        self.phase_total.with_label_values(&[status]).get()
    }

    pub fn hook_count(&self, status: &str) -> u64 {
        self.hook_total.with_label_values(&[status]).get()
    }
}
