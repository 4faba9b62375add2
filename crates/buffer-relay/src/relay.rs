//! Operator commands over a running buffer.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use serde::Serialize;
use serde_json::Value;
use shutdown_coordinator::{
    GracefulShutdownHook, HookOutcome, ShutdownConfig, ShutdownCoordinator, ShutdownMetrics,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use write_behind_buffer::{
    AlertSink, BufferStrategy, DeadLetter, DistributedBuffer, FileBackup, PrometheusMetrics,
    QueueCounts, RecoverySweeper, StrategyKind, TracingAlertSink,
};

/// Result of `export-dead-letters`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportReport {
    pub exported: usize,
    pub path: PathBuf,
}

pub struct Relay {
    buffer: Arc<dyn BufferStrategy<Value>>,
    config: RelayConfig,
    metrics: PrometheusMetrics,
    shutdown_metrics: ShutdownMetrics,
    shutdown: ShutdownConfig,
}

impl Relay {
    /// Connect to the Redis buffer named by `config`.
    pub async fn connect(config: RelayConfig) -> RelayResult<Self> {
        config.validate()?;
        let metrics = PrometheusMetrics::standalone(StrategyKind::Distributed.as_str())
            .map_err(|e| RelayError::Metrics(e.to_string()))?;
        let buffer: DistributedBuffer<Value> =
            DistributedBuffer::connect(&config.redis_url, &config.buffer, Arc::new(metrics.clone()))
                .await?;
        info!(
            redis_url = %config.redis_url,
            namespace = %config.buffer.namespace,
            "Relay connected"
        );
        Self::new(Arc::new(buffer), config, metrics)
    }

    /// Wrap an existing buffer. `metrics` should be the sink the buffer reports to.
    pub fn new(
        buffer: Arc<dyn BufferStrategy<Value>>,
        config: RelayConfig,
        metrics: PrometheusMetrics,
    ) -> RelayResult<Self> {
        let shutdown_metrics = ShutdownMetrics::register(metrics.registry())
            .map_err(|e| RelayError::Metrics(e.to_string()))?;
        Ok(Self {
            buffer,
            config,
            metrics,
            shutdown_metrics,
            shutdown: ShutdownConfig::from_env(),
        })
    }

    pub fn with_shutdown_config(mut self, shutdown: ShutdownConfig) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn metrics(&self) -> &PrometheusMetrics {
        &self.metrics
    }

    pub fn shutdown_metrics(&self) -> &ShutdownMetrics {
        &self.shutdown_metrics
    }

    /// Current set sizes. Also refreshes the queue-size gauges.
    pub async fn stats(&self) -> RelayResult<QueueCounts> {
        Ok(self.buffer.counts().await?)
    }

    /// Where exports go when no `--out` is given.
    pub fn dead_letter_path(&self) -> PathBuf {
        self.config
            .dead_letter_path
            .clone()
            .unwrap_or_else(FileBackup::default_path)
    }

    /// Poll up to `limit` entries off DEAD and append them to `backup`.
    ///
    /// Polling removes entries, so a record that cannot be written is raised
    /// through the alert sink with its full payload before the error returns.
    pub async fn export_dead_letters(
        &self,
        limit: usize,
        backup: &FileBackup,
    ) -> RelayResult<ExportReport> {
        let alerts = TracingAlertSink;
        let mut exported = 0;

        while exported < limit {
            let chunk = (limit - exported).min(self.config.buffer.recovery_batch_size);
            let messages = self.buffer.poll_dead_letters(chunk).await?;
            if messages.is_empty() {
                break;
            }

            let mut letters = Vec::with_capacity(messages.len());
            for message in &messages {
                letters.push(DeadLetter::from_message(message, "exported from dead-letter queue")?);
            }

            for (i, letter) in letters.iter().enumerate() {
                if let Err(e) = backup.append(letter).await {
                    error!(
                        error = %e,
                        path = %backup.path().display(),
                        "Dead-letter export failed"
                    );
                    for unwritten in &letters[i..] {
                        alerts.critical(unwritten, "export failed", &[e.to_string()]);
                    }
                    return Err(e.into());
                }
                exported += 1;
            }
        }

        info!(exported, path = %backup.path().display(), "Exported dead letters");
        Ok(ExportReport {
            exported,
            path: backup.path().to_path_buf(),
        })
    }

    /// Run the recovery sweeper until `signal` resolves, then stop it through
    /// the graceful shutdown hook.
    pub async fn sweep(&self, signal: impl Future<Output = ()>) -> HookOutcome {
        let sweeper = Arc::new(RecoverySweeper::new(self.buffer.clone(), &self.config.buffer));
        let task = sweeper.clone().spawn();

        signal.await;
        info!("Shutdown signal received, stopping sweeper");

        let mut coordinator =
            ShutdownCoordinator::new(self.shutdown.clone()).with_metrics(self.shutdown_metrics.clone());
        coordinator.register(sweeper);
        let hook = GracefulShutdownHook::from_coordinator(Arc::new(coordinator))
            .with_metrics(self.shutdown_metrics.clone());

        let outcome = hook.run().await;
        if outcome.is_completed() {
            if let Err(e) = task.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;
    use write_behind_buffer::{BufferConfig, InMemoryBuffer, MetricsSink};

    fn relay_with(buffer_config: BufferConfig) -> (Relay, Arc<InMemoryBuffer<Value>>) {
        let metrics = PrometheusMetrics::standalone("memory").unwrap();
        let sink: Arc<dyn MetricsSink> = Arc::new(metrics.clone());
        let buffer = Arc::new(InMemoryBuffer::new(&buffer_config, sink));
        let config = RelayConfig {
            buffer: buffer_config,
            ..Default::default()
        };
        let relay = Relay::new(buffer.clone(), config, metrics)
            .unwrap()
            .with_shutdown_config(ShutdownConfig {
                component_timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(5),
                hook_deadline: Duration::from_secs(2),
            });
        (relay, buffer)
    }

    async fn kill(buffer: &InMemoryBuffer<Value>, n: u64) {
        for i in 0..n {
            let _ = buffer.offer("orders", json!({"order": i})).await.unwrap();
            let message = buffer.consume(1).await.unwrap().remove(0);
            let current = buffer.max_retries();
            let _ = buffer.nack(&message.id, current).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stats_refreshes_gauges() {
        let (relay, buffer) = relay_with(BufferConfig::default());
        let _ = buffer
            .offer_batch("k", vec![json!(1), json!(2), json!(3)])
            .await
            .unwrap();
        let _ = buffer.consume(1).await.unwrap();

        let counts = relay.stats().await.unwrap();
        assert_eq!((counts.pending, counts.inflight), (2, 1));
        assert!(relay
            .metrics()
            .gather_text()
            .contains("write_behind_queue_size{set=\"pending\",strategy=\"memory\"} 2"));
    }

    #[tokio::test]
    async fn test_export_respects_limit_and_chunks() {
        let dir = tempdir().unwrap();
        let (relay, buffer) = relay_with(BufferConfig {
            recovery_batch_size: 2,
            ..Default::default()
        });
        kill(&buffer, 5).await;

        let backup = FileBackup::new(dir.path().join("export.jsonl"));
        let report = relay.export_dead_letters(4, &backup).await.unwrap();
        assert_eq!(report.exported, 4);

        let letters = backup.read_all().await.unwrap();
        assert_eq!(letters.len(), 4);
        assert_eq!(letters[0].payload, json!({"order": 0}));
        assert_eq!(letters[0].retry_count, 4);
        assert_eq!(letters[0].key, "orders");
        assert_eq!(buffer.counts().await.unwrap().dead, 1);

        let report = relay.export_dead_letters(10, &backup).await.unwrap();
        assert_eq!(report.exported, 1);
        assert_eq!(backup.read_all().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_export_empty_queue() {
        let dir = tempdir().unwrap();
        let (relay, _) = relay_with(BufferConfig::default());
        let backup = FileBackup::new(dir.path().join("export.jsonl"));

        let report = relay.export_dead_letters(10, &backup).await.unwrap();
        assert_eq!(report.exported, 0);
        assert!(!backup.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_stops_on_signal() {
        let (relay, _) = relay_with(BufferConfig::default());

        let outcome = relay
            .sweep(tokio::time::sleep(Duration::from_millis(20)))
            .await;

        match outcome {
            HookOutcome::Completed(report) => assert!(report.is_clean()),
            other => panic!("expected completed shutdown, got {:?}", other),
        }
        assert_eq!(relay.shutdown_metrics().hook_count("success"), 1);
        assert_eq!(relay.shutdown_metrics().phase_count("success"), 1);
    }

    #[test]
    fn test_dead_letter_path_prefers_config() {
        let (relay, _) = relay_with(BufferConfig::default());
        assert_eq!(relay.dead_letter_path(), FileBackup::default_path());

        let mut config = RelayConfig::default();
        config.dead_letter_path = Some(PathBuf::from("/var/lib/relay/dlq.jsonl"));
        let metrics = PrometheusMetrics::standalone("memory").unwrap();
        let buffer = Arc::new(InMemoryBuffer::<Value>::new(
            &config.buffer,
            Arc::new(metrics.clone()),
        ));
        let relay = Relay::new(buffer, config, metrics).unwrap();
        assert_eq!(relay.dead_letter_path(), PathBuf::from("/var/lib/relay/dlq.jsonl"));
    }
}
