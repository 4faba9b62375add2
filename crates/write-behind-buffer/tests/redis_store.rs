//! Integration tests against a live Redis (6.2 or newer).
//!
//! Run with `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`.
//! Every test uses its own namespace and deletes its keys afterwards.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use write_behind_buffer::{
    BufferConfig, BufferResult, BufferStrategy, DistributedBuffer, NackOutcome, NoopMetrics,
    QueueStore, RedisQueueStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Event {
    seq: u64,
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

fn test_config(capacity: usize, max_retries: u32) -> BufferConfig {
    BufferConfig {
        namespace: format!("wbb-test-{}", uuid::Uuid::new_v4()),
        max_capacity: capacity,
        max_retries,
        retry_base_delay_ms: 0,
        ..Default::default()
    }
}

async fn cleanup(store: &RedisQueueStore) {
    let Ok(client) = redis::Client::open(redis_url()) else {
        return;
    };
    let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
        return;
    };
    let keys: Vec<&str> = store.keys().ordered().to_vec();
    let _: redis::RedisResult<()> = redis::cmd("DEL").arg(keys).query_async(&mut conn).await;
}

async fn connect(config: &BufferConfig) -> BufferResult<DistributedBuffer<Event>> {
    DistributedBuffer::connect(&redis_url(), config, Arc::new(NoopMetrics)).await
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_publish_consume_ack() -> BufferResult<()> {
    let config = test_config(100, 3);
    let buffer = connect(&config).await?;

    let ids = buffer
        .offer_batch("k", (0..5).map(|seq| Event { seq }).collect())
        .await?
        .accepted()
        .expect("accepted");
    assert_eq!(ids.len(), 5);

    let batch = buffer.consume(10).await?;
    let seqs: Vec<u64> = batch.iter().map(|m| m.payload.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4], "consume is FIFO");
    assert_eq!(buffer.counts().await?.inflight, 5);

    for message in &batch {
        assert!(buffer.ack(&message.id).await?);
        assert!(!buffer.ack(&message.id).await?, "second ack is a no-op");
    }
    assert_eq!(buffer.counts().await?.total(), 0);

    cleanup(buffer.store()).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_capacity_rejects_whole_batch() -> BufferResult<()> {
    let config = test_config(5, 3);
    let buffer = connect(&config).await?;

    let offer = buffer
        .offer_batch("k", (0..8).map(|seq| Event { seq }).collect())
        .await?;
    assert!(!offer.is_accepted());
    assert_eq!(buffer.counts().await?.total(), 0);

    let offer = buffer
        .offer_batch("k", (0..5).map(|seq| Event { seq }).collect())
        .await?;
    assert!(offer.is_accepted());

    cleanup(buffer.store()).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_retry_then_dead() -> BufferResult<()> {
    let config = test_config(10, 2);
    let buffer = connect(&config).await?;
    let _ = buffer.offer("k", Event { seq: 7 }).await?;

    for expected in 1..=2 {
        let message = buffer.consume(1).await?.remove(0);
        assert_eq!(message.retry_count, expected - 1);
        match buffer.nack(&message.id, message.retry_count).await? {
            NackOutcome::Retry { retry_count, .. } => assert_eq!(retry_count, expected),
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(buffer.process_retry_rollover(10).await?, 1);
    }

    let message = buffer.consume(1).await?.remove(0);
    assert_eq!(message.retry_count, 2);
    assert_eq!(
        buffer.nack(&message.id, 2).await?,
        NackOutcome::Dead { retry_count: 3 }
    );

    let dead = buffer.poll_dead_letters(10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 3);
    assert_eq!(dead[0].payload, Event { seq: 7 });
    assert_eq!(buffer.counts().await?.total(), 0);

    cleanup(buffer.store()).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redrive_stuck_message() -> BufferResult<()> {
    let config = test_config(10, 3);
    let buffer = connect(&config).await?;
    let _ = buffer.offer("k", Event { seq: 1 }).await?;

    let stuck = buffer.consume(1).await?.remove(0);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let expired = buffer
        .expired_inflight(Duration::from_millis(10), 10)
        .await?;
    assert_eq!(expired, vec![stuck.id.clone()]);
    assert!(buffer.redrive(&stuck.id).await?);
    assert!(!buffer.ack(&stuck.id).await?, "redriven id is no longer in flight");

    let again = buffer.consume(1).await?.remove(0);
    assert_eq!(again.id, stuck.id);
    assert!(buffer.ack(&again.id).await?);

    cleanup(buffer.store()).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_scripts_reload_after_flush() -> BufferResult<()> {
    let config = test_config(10, 3);
    let store = RedisQueueStore::connect(&redis_url(), &config.namespace).await?;

    let client = redis::Client::open(redis_url())?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("SCRIPT").arg("FLUSH").query_async(&mut conn).await?;

    // EVALSHA fails with NOSCRIPT and the invocation falls back to EVAL.
    assert!(store.publish(&[("id-1".into(), "{}".into())], 10).await?);
    assert_eq!(store.counts().await?.pending, 1);

    cleanup(&store).await;
    Ok(())
}
