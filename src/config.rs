//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Engine and protocol configuration.
///
/// Defaults match the protocol documentation; every knob is overridable from
/// the server binary via flags or environment variables.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Storage directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    /// How long a `live=long-poll` read waits for new data.
    pub long_poll_timeout: Duration,

    /// Interval between SSE `control` heartbeat events.
    pub sse_heartbeat: Duration,

    /// Maximum size of a single message payload.
    pub max_message_bytes: usize,

    /// Maximum size of an append request body.
    pub max_batch_bytes: usize,

    /// Page limits for historical reads.
    pub max_read_messages: usize,
    pub max_read_bytes: usize,

    /// Producer fence entries idle past this are treated as absent.
    pub producer_state_ttl: Duration,

    /// Per-attempt timeout for webhook deliveries.
    pub webhook_delivery_timeout: Duration,

    /// Upper bound applied to `Retry-After` values from webhook targets.
    pub retry_after_cap: Duration,

    /// Allow `POST` to create a missing stream with the request content type.
    pub create_on_append: bool,

    /// Cursor bucket width and epoch for resumable polls.
    pub cursor_interval: Duration,
    pub cursor_epoch: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            long_poll_timeout: Duration::from_secs(30),
            sse_heartbeat: Duration::from_secs(30),
            max_message_bytes: 4 * 1024 * 1024,
            max_batch_bytes: 16 * 1024 * 1024,
            max_read_messages: 1000,
            max_read_bytes: 4 * 1024 * 1024,
            producer_state_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            webhook_delivery_timeout: Duration::from_secs(10),
            retry_after_cap: Duration::from_secs(60),
            create_on_append: false,
            cursor_interval: Duration::from_secs(20),
            cursor_epoch: 0,
        }
    }
}
