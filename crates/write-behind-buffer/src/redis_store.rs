//! Redis implementation of [`QueueStore`].

use crate::error::{BufferError, BufferResult};
use crate::keys::BufferKeys;
use crate::scripts::BufferScripts;
use crate::store::{pair_flat_reply, CheckedOut, QueueStore};
use crate::strategy::QueueCounts;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script, ScriptInvocation};
use tracing::{debug, info};

/// Script-backed queue store over an auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    keys: BufferKeys,
    scripts: std::sync::Arc<BufferScripts>,
}

impl RedisQueueStore {
    /// Connect and warm the server's script cache.
    pub async fn connect(redis_url: &str, namespace: &str) -> BufferResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        let store = Self::with_connection(conn, namespace);
        store.preload().await?;
        info!(namespace, main = %store.keys.main, "Connected buffer store to Redis");
        Ok(store)
    }

    pub fn with_connection(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            keys: BufferKeys::new(namespace),
            scripts: std::sync::Arc::new(BufferScripts::new()),
        }
    }

    pub fn keys(&self) -> &BufferKeys {
        &self.keys
    }

    /// `SCRIPT LOAD` every script. Invocations reload on `NOSCRIPT` anyway,
    /// this only saves the first round trip after a server restart.
    pub async fn preload(&self) -> BufferResult<()> {
        let mut conn = self.conn.clone();
        for (source, expected) in BufferScripts::sources().iter().zip(self.scripts.hashes()) {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async(&mut conn)
                .await?;
            if sha != expected {
                return Err(BufferError::Protocol(format!(
                    "script hash mismatch: server {} expected {}",
                    sha, expected
                )));
            }
        }
        debug!("Preloaded buffer scripts");
        Ok(())
    }

    fn invocation<'a>(&self, script: &'a Script) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in self.keys.ordered() {
            invocation.key(key);
        }
        invocation
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn publish(&self, entries: &[(String, String)], capacity: usize) -> BufferResult<bool> {
        let mut invocation = self.invocation(&self.scripts.publish);
        invocation.arg(capacity);
        for (id, envelope) in entries {
            invocation.arg(id).arg(envelope);
        }
        let accepted: i64 = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(accepted == 1)
    }

    async fn consume(&self, max: usize, now_ms: i64) -> BufferResult<Vec<CheckedOut>> {
        let mut invocation = self.invocation(&self.scripts.consume);
        invocation.arg(max).arg(now_ms);
        let flat: Vec<Option<String>> = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(pair_flat_reply(flat))
    }

    async fn ack(&self, id: &str) -> BufferResult<bool> {
        let mut invocation = self.invocation(&self.scripts.ack);
        invocation.arg(id);
        let removed: i64 = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(removed == 1)
    }

    async fn nack_to_retry(&self, id: &str, retry_count: u32, next_attempt_ms: i64) -> BufferResult<bool> {
        let mut invocation = self.invocation(&self.scripts.nack_to_retry);
        invocation.arg(id).arg(retry_count).arg(next_attempt_ms);
        let moved: i64 = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(moved == 1)
    }

    async fn nack_to_dead(&self, id: &str, retry_count: u32) -> BufferResult<bool> {
        let mut invocation = self.invocation(&self.scripts.nack_to_dead);
        invocation.arg(id).arg(retry_count);
        let moved: i64 = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(moved == 1)
    }

    async fn redrive(&self, id: &str) -> BufferResult<bool> {
        let mut invocation = self.invocation(&self.scripts.redrive);
        invocation.arg(id);
        let moved: i64 = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(moved == 1)
    }

    async fn rollover(&self, now_ms: i64, limit: usize) -> BufferResult<usize> {
        let mut invocation = self.invocation(&self.scripts.retry_rollover);
        invocation.arg(now_ms).arg(limit);
        let moved: usize = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(moved)
    }

    async fn expired_inflight(&self, cutoff_ms: i64, limit: usize) -> BufferResult<Vec<String>> {
        let mut invocation = self.invocation(&self.scripts.expired_inflight);
        invocation.arg(cutoff_ms).arg(limit);
        let ids: Vec<String> = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(ids)
    }

    async fn poll_dead(&self, max: usize) -> BufferResult<Vec<CheckedOut>> {
        let mut invocation = self.invocation(&self.scripts.poll_dead);
        invocation.arg(max);
        let flat: Vec<Option<String>> = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(pair_flat_reply(flat))
    }

    async fn counts(&self) -> BufferResult<QueueCounts> {
        let invocation = self.invocation(&self.scripts.counts);
        let sizes: Vec<usize> = invocation.invoke_async(&mut self.conn.clone()).await?;
        match sizes.as_slice() {
            [pending, inflight, retry, dead] => Ok(QueueCounts {
                pending: *pending,
                inflight: *inflight,
                retry: *retry,
                dead: *dead,
            }),
            other => Err(BufferError::Protocol(format!(
                "counts script returned {} values",
                other.len()
            ))),
        }
    }

    async fn ping(&self) -> BufferResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn.clone()).await?;
        Ok(())
    }
}
