//! Metrics sink for buffer events and queue sizes.
//!
//! Engines and background tasks report through [`MetricsSink`]. The
//! Prometheus implementation keeps its own [`Registry`] handle so several
//! buffers (or test cases) never collide on the process-global registry.

use crate::message::QueueSet;
use crate::strategy::QueueCounts;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Monotonic buffer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferCounter {
    Published,
    Consumed,
    Acked,
    AckNotFound,
    RejectedBackpressure,
    RejectedShutdown,
    NackRetry,
    NackDead,
    NackNotFound,
    Redriven,
    RedriveSkipped,
    RetryRolledOver,
    DeadLetterPolled,
    DeadLetterStored,
    DeadLetterFileBackup,
    DeadLetterCritical,
    PersistFailed,
    CorruptPayload,
}

impl BufferCounter {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferCounter::Published => "published",
            BufferCounter::Consumed => "consumed",
            BufferCounter::Acked => "acked",
            BufferCounter::AckNotFound => "ack_not_found",
            BufferCounter::RejectedBackpressure => "rejected_backpressure",
            BufferCounter::RejectedShutdown => "rejected_shutdown",
            BufferCounter::NackRetry => "nack_retry",
            BufferCounter::NackDead => "nack_dead",
            BufferCounter::NackNotFound => "nack_not_found",
            BufferCounter::Redriven => "redriven",
            BufferCounter::RedriveSkipped => "redrive_skipped",
            BufferCounter::RetryRolledOver => "retry_rolled_over",
            BufferCounter::DeadLetterPolled => "dead_letter_polled",
            BufferCounter::DeadLetterStored => "dead_letter_stored",
            BufferCounter::DeadLetterFileBackup => "dead_letter_file_backup",
            BufferCounter::DeadLetterCritical => "dead_letter_critical",
            BufferCounter::PersistFailed => "persist_failed",
            BufferCounter::CorruptPayload => "corrupt_payload",
        }
    }
}

/// Point-in-time set sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferGauge {
    Pending,
    Inflight,
    Retry,
    Dead,
}

impl BufferGauge {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferGauge::Pending => "pending",
            BufferGauge::Inflight => "inflight",
            BufferGauge::Retry => "retry",
            BufferGauge::Dead => "dead",
        }
    }
}

impl From<QueueSet> for BufferGauge {
    fn from(set: QueueSet) -> Self {
        match set {
            QueueSet::Main => BufferGauge::Pending,
            QueueSet::Inflight => BufferGauge::Inflight,
            QueueSet::Retry => BufferGauge::Retry,
            QueueSet::Dead => BufferGauge::Dead,
        }
    }
}

/// Refresh every queue-size gauge from one snapshot.
pub(crate) fn report_counts(metrics: &dyn MetricsSink, counts: &QueueCounts) {
    for set in QueueSet::ALL {
        metrics.set_gauge(BufferGauge::from(set), counts.get(set) as i64);
    }
}

pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: BufferCounter, by: u64);
    fn set_gauge(&self, gauge: BufferGauge, value: i64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: BufferCounter, _by: u64) {}
    fn set_gauge(&self, _gauge: BufferGauge, _value: i64) {}
}

/// Prometheus-backed sink.
///
/// Exposes `write_behind_events_total{strategy,event}` and
/// `write_behind_queue_size{strategy,set}`.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    events: IntCounterVec,
    queue_size: IntGaugeVec,
    strategy: Arc<str>,
}

impl PrometheusMetrics {
    /// Register the metric families in `registry`, labelled with `strategy`.
    pub fn register(registry: &Registry, strategy: &str) -> prometheus::Result<Self> {
        let events = IntCounterVec::new(
            Opts::new("write_behind_events_total", "Write-behind buffer events"),
            &["strategy", "event"],
        )?;
        let queue_size = IntGaugeVec::new(
            Opts::new("write_behind_queue_size", "Write-behind buffer set sizes"),
            &["strategy", "set"],
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;
        Ok(Self {
            registry: registry.clone(),
            events,
            queue_size,
            strategy: Arc::from(strategy),
        })
    }

    /// A private registry, for callers that export nothing.
    pub fn standalone(strategy: &str) -> prometheus::Result<Self> {
        Self::register(&Registry::new(), strategy)
    }

    /// Same metric families, different `strategy` label.
    pub fn with_strategy(&self, strategy: &str) -> Self {
        Self {
            strategy: Arc::from(strategy),
            ..self.clone()
        }
    }

    pub fn counter(&self, counter: BufferCounter) -> u64 {
        self.events
            .with_label_values(&[self.strategy.as_ref(), counter.as_str()])
            .get()
    }

    pub fn gauge(&self, gauge: BufferGauge) -> i64 {
        self.queue_size
            .with_label_values(&[self.strategy.as_ref(), gauge.as_str()])
            .get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format of everything in the registry.
    pub fn gather_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment(&self, counter: BufferCounter, by: u64) {
        self.events
            .with_label_values(&[self.strategy.as_ref(), counter.as_str()])
            .inc_by(by);
    }

    fn set_gauge(&self, gauge: BufferGauge, value: i64) {
        self.queue_size
            .with_label_values(&[self.strategy.as_ref(), gauge.as_str()])
            .set(value);
    }
}
