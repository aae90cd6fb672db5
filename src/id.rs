//! ID generation utilities
//!
//! Queued messages carry an id so every log line about one delivery can be
//! correlated across requeues and worker processes.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique message ID
///
/// Format: `msg-{timestamp_ms}-{random_hex}`
/// Example: `msg-1738300800123-a1b2c3d4`
pub fn generate_message_id() -> String {
    let timestamp = now_ms();
    let random: u32 = rand::rng().random();
    format!("msg-{}-{:08x}", timestamp, random)
}
