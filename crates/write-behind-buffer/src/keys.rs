//! Redis key layout.
//!
//! All six keys share the `{namespace}` hash tag so they land in the same
//! cluster slot and one script can touch all of them.

/// ```text
/// {ns}:buffer              MAIN list
/// {ns}:buffer:inflight     INFLIGHT list
/// {ns}:buffer:inflight:ts  sorted set, score = checkout epoch ms
/// {ns}:buffer:payload      hash id -> envelope
/// {ns}:buffer:retry        sorted set, score = next attempt epoch ms
/// {ns}:buffer:dlq          DEAD list
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferKeys {
    pub main: String,
    pub inflight: String,
    pub inflight_ts: String,
    pub payload: String,
    pub retry: String,
    pub dead: String,
}

impl BufferKeys {
    pub fn new(namespace: &str) -> Self {
        let base = format!("{{{}}}:buffer", namespace);
        Self {
            inflight: format!("{}:inflight", base),
            inflight_ts: format!("{}:inflight:ts", base),
            payload: format!("{}:payload", base),
            retry: format!("{}:retry", base),
            dead: format!("{}:dlq", base),
            main: base,
        }
    }

    /// Keys in the order every script expects them as `KEYS[1..6]`.
    pub fn ordered(&self) -> [&str; 6] {
        [
            &self.main,
            &self.inflight,
            &self.inflight_ts,
            &self.payload,
            &self.retry,
            &self.dead,
        ]
    }
}
