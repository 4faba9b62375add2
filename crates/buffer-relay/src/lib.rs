//! Buffer relay: operator tooling for a Redis-backed write-behind buffer.
//!
//! - `stats` reports set sizes.
//! - `sweep` runs retry rollover and stuck-message redrive until signalled.
//! - `export-dead-letters` drains DEAD into a JSONL file.
//!
//! Payloads are opaque JSON; the relay never interprets them.

pub mod config;
pub mod error;
pub mod relay;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use relay::{ExportReport, Relay};
