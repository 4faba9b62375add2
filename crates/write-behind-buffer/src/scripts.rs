//! Server-side scripts, one per state transition.
//!
//! Every script receives the full key set as `KEYS[1..6]` in
//! [`crate::BufferKeys::ordered`] order: main, inflight, inflight_ts,
//! payload, retry, dead. `LMOVE` requires Redis 6.2 or newer.

use redis::Script;

/// `ARGV`: capacity, then (id, envelope) pairs. All or nothing.
pub const PUBLISH: &str = r#"
local n = (#ARGV - 1) / 2
local live = redis.call('LLEN', KEYS[1]) + redis.call('LLEN', KEYS[2]) + redis.call('ZCARD', KEYS[5])
if live + n > tonumber(ARGV[1]) then
  return 0
end
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[4], ARGV[i], ARGV[i + 1])
  redis.call('RPUSH', KEYS[1], ARGV[i])
end
return 1
"#;

/// `ARGV`: max, now_ms. Returns a flat list of id, envelope (nil if missing).
pub const CONSUME: &str = r#"
local out = {}
for i = 1, tonumber(ARGV[1]) do
  local id = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
  if not id then
    break
  end
  redis.call('ZADD', KEYS[3], ARGV[2], id)
  table.insert(out, id)
  table.insert(out, redis.call('HGET', KEYS[4], id))
end
return out
"#;

/// `ARGV`: id. Returns 1 if removed, 0 if it was not in flight.
pub const ACK: &str = r#"
if redis.call('LREM', KEYS[2], 0, ARGV[1]) == 0 then
  return 0
end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

// Rewrites the top-level retry_count field in place. The payload body is
// an escaped JSON string, so its own quotes never match the pattern.
const REWRITE_RETRY_COUNT: &str = r#"
local function rewrite_retry_count(id, count)
  local raw = redis.call('HGET', KEYS[4], id)
  if raw then
    local updated = string.gsub(raw, '"retry_count":%d+', '"retry_count":' .. count, 1)
    redis.call('HSET', KEYS[4], id, updated)
  end
end
"#;

/// `ARGV`: id, retry_count, next_attempt_ms.
pub const NACK_TO_RETRY: &str = r#"
if redis.call('LREM', KEYS[2], 0, ARGV[1]) == 0 then
  return 0
end
redis.call('ZREM', KEYS[3], ARGV[1])
rewrite_retry_count(ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[5], ARGV[3], ARGV[1])
return 1
"#;

/// `ARGV`: id, retry_count. Payload stays in the hash for inspection.
pub const NACK_TO_DEAD: &str = r#"
if redis.call('LREM', KEYS[2], 0, ARGV[1]) == 0 then
  return 0
end
redis.call('ZREM', KEYS[3], ARGV[1])
rewrite_retry_count(ARGV[1], ARGV[2])
redis.call('RPUSH', KEYS[6], ARGV[1])
return 1
"#;

/// `ARGV`: id. The LREM is the presence check, so ack and redrive can
/// never both succeed.
pub const REDRIVE: &str = r#"
if redis.call('LREM', KEYS[2], 0, ARGV[1]) == 0 then
  return 0
end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('RPUSH', KEYS[1], ARGV[1])
return 1
"#;

/// `ARGV`: now_ms, limit. Returns the number moved.
pub const RETRY_ROLLOVER: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[5], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[5], id)
  redis.call('RPUSH', KEYS[1], id)
end
return #due
"#;

/// `ARGV`: cutoff_ms, limit. Read only.
pub const EXPIRED_INFLIGHT: &str = r#"
return redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
"#;

/// `ARGV`: max. Pops DEAD and deletes the payloads it returns.
pub const POLL_DEAD: &str = r#"
local out = {}
for i = 1, tonumber(ARGV[1]) do
  local id = redis.call('LPOP', KEYS[6])
  if not id then
    break
  end
  table.insert(out, id)
  table.insert(out, redis.call('HGET', KEYS[4], id))
  redis.call('HDEL', KEYS[4], id)
end
return out
"#;

/// Returns pending, inflight, retry, dead.
pub const COUNTS: &str = r#"
return {
  redis.call('LLEN', KEYS[1]),
  redis.call('LLEN', KEYS[2]),
  redis.call('ZCARD', KEYS[5]),
  redis.call('LLEN', KEYS[6])
}
"#;

/// Compiled scripts. Each [`Script`] caches its SHA1; invocation tries
/// `EVALSHA` and reloads the source on `NOSCRIPT`.
pub struct BufferScripts {
    pub publish: Script,
    pub consume: Script,
    pub ack: Script,
    pub nack_to_retry: Script,
    pub nack_to_dead: Script,
    pub redrive: Script,
    pub retry_rollover: Script,
    pub expired_inflight: Script,
    pub poll_dead: Script,
    pub counts: Script,
}

impl BufferScripts {
    pub fn new() -> Self {
        Self {
            publish: Script::new(PUBLISH),
            consume: Script::new(CONSUME),
            ack: Script::new(ACK),
            nack_to_retry: Script::new(&with_rewrite(NACK_TO_RETRY)),
            nack_to_dead: Script::new(&with_rewrite(NACK_TO_DEAD)),
            redrive: Script::new(REDRIVE),
            retry_rollover: Script::new(RETRY_ROLLOVER),
            expired_inflight: Script::new(EXPIRED_INFLIGHT),
            poll_dead: Script::new(POLL_DEAD),
            counts: Script::new(COUNTS),
        }
    }

    /// Full source of every script, for `SCRIPT LOAD` warm-up.
    pub fn sources() -> Vec<String> {
        vec![
            PUBLISH.to_string(),
            CONSUME.to_string(),
            ACK.to_string(),
            with_rewrite(NACK_TO_RETRY),
            with_rewrite(NACK_TO_DEAD),
            REDRIVE.to_string(),
            RETRY_ROLLOVER.to_string(),
            EXPIRED_INFLIGHT.to_string(),
            POLL_DEAD.to_string(),
            COUNTS.to_string(),
        ]
    }

    pub fn hashes(&self) -> Vec<&str> {
        vec![
            self.publish.get_hash(),
            self.consume.get_hash(),
            self.ack.get_hash(),
            self.nack_to_retry.get_hash(),
            self.nack_to_dead.get_hash(),
            self.redrive.get_hash(),
            self.retry_rollover.get_hash(),
            self.expired_inflight.get_hash(),
            self.poll_dead.get_hash(),
            self.counts.get_hash(),
        ]
    }
}

impl Default for BufferScripts {
    fn default() -> Self {
        Self::new()
    }
}

fn with_rewrite(body: &str) -> String {
    format!("{}{}", REWRITE_RETRY_COUNT, body)
}
