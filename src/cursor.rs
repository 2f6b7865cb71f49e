//! Resumable-poll cursor tokens.
//!
//! A cursor is a time-bucket counter, opaque to clients. Presenting it on
//! reconnect keeps the request cache-key moving forward so collapsed
//! long-polls never replay a stale intermediary response.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug)]
pub struct CursorOptions {
    /// Bucket width.
    pub interval: Duration,
    /// Deployment-wide offset so cursors differ across epochs/restarts.
    pub epoch: u64,
}

/// Parse a client-presented cursor. Invalid input is ignored rather than
/// rejected; the cursor is a hint, not state the engine depends on.
pub fn parse_cursor(raw: &str) -> Option<u64> {
    raw.parse::<u64>().ok()
}

/// Compute the cursor to hand back, strictly newer than anything the client
/// already holds.
pub fn generate_response_cursor(client: Option<u64>, options: &CursorOptions) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let interval = options.interval.as_secs().max(1);
    let current = options.epoch + now / interval;
    match client {
        Some(c) => current.max(c + 1),
        None => current,
    }
}
