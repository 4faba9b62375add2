//! Scenario tests for the write-behind buffer.
//!
//! Engine-agnostic behaviors run against both engines: the in-process
//! buffer directly, the distributed buffer over `MockQueueStore`, which
//! mirrors the Lua scripts transition for transition.
//!
//! Keeping the mock honest: each `MockQueueStore` method matches one
//! script in `scripts.rs` (same key order, same presence check before any
//! move, same return shape). A change to a script needs the matching mock
//! method changed with it. The mock decodes and re-encodes envelopes where
//! the scripts rewrite `"retry_count":N` with `string.gsub`; the envelope
//! shape that substitution depends on is checked in `message.rs`, and the
//! scripts themselves run in `tests/redis_store.rs` against a live Redis
//! (`cargo test -- --ignored` with `REDIS_URL` set).
//!
//! - `harness.rs`      - Mock store, test payload, persisters, dead-letter doubles
//! - `conservation.rs` - I. Conservation and normal flow (Rules 1-4)
//! - `ack.rs`          - II. Idempotent ack (Rules 5-7)
//! - `retry.rs`        - III. Retry monotonicity and dead-lettering (Rules 8-13)
//! - `redrive.rs`      - IV. Stuck-consumer recovery and ack/redrive exclusion (Rules 14-18)
//! - `backpressure.rs` - V. Backpressure exactness (Rules 19-23)
//! - `shutdown.rs`     - VI. Shutdown admission, drain and coordination (Rules 24-29)
//! - `dead_letter.rs`  - VII. Triple safety net (Rules 30-34)
//! - `worker.rs`       - VIII. Consumer worker and poison messages (Rules 35-40)

pub(crate) mod harness;
