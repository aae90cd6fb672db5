//! signal-courier - rate-limited market-signal notification delivery
//!
//! signal-courier moves market-signal notifications from analysis code to
//! chat recipients without tripping provider rate limits. It provides a
//! periodic job scheduler, a per-recipient notification guard, and a
//! Redis-backed priority delivery queue whose workers share one global token
//! bucket across processes.

pub mod chat;
pub mod error;
pub mod guard;
pub mod id;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use error::{CourierError, Result};
