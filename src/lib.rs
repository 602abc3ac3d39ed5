pub mod config;
pub mod crypto;
pub mod db;
pub mod events;
pub mod media;
pub mod presence;
pub mod server;
pub mod sweeper;
pub mod translate;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; the timestamp unit used on the wire
/// and in the persisted document.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
