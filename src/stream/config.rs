//! Configuration for the alert event stream

use std::time::Duration;

/// Automatic reconnect attempts allowed between successful connections
pub const MAX_RETRIES: u32 = 5;

/// Delay before the first automatic reconnect attempt
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(1_000);

/// Upper bound on any single reconnect delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(10_000);

/// Most recent events kept in memory for display
pub const EVENT_BUFFER_CAPACITY: usize = 50;

/// Largest single event (pending line plus accumulated data) accepted from the wire
pub const MAX_EVENT_SIZE: usize = 1024 * 1024;

/// Default backend stream endpoint
pub const DEFAULT_STREAM_URL: &str = "http://127.0.0.1:8000/api/alerts/stream";

/// Event stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// SSE endpoint URL
    pub url: String,
    /// Maximum automatic reconnect attempts before waiting for a manual reconnect
    pub max_retries: u32,
    /// Backoff base delay
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Event buffer capacity
    pub buffer_capacity: usize,
    /// Bound on one event's size before the connection is treated as failed
    pub max_event_size: usize,
    /// Timeout for the TCP connect and for the response headers (not the stream itself)
    pub connect_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            max_retries: MAX_RETRIES,
            base_delay: BASE_RETRY_DELAY,
            max_delay: MAX_RETRY_DELAY,
            buffer_capacity: EVENT_BUFFER_CAPACITY,
            max_event_size: MAX_EVENT_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl StreamConfig {
    /// Create a configuration for a custom endpoint
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the HTTP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-indexed)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        super::backoff::retry_delay(attempt, self.base_delay, self.max_delay)
    }
}
