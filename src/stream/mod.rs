//! Real-time alert stream
//!
//! A single long-lived SSE connection to the screener backend, with
//! capped exponential-backoff reconnects, a bounded newest-first event
//! buffer and visibility-aware recovery.

mod backoff;
mod buffer;
mod config;
mod event;
mod machine;
mod manager;
mod notify;
mod sse;
mod transport;

pub use backoff::retry_delay;
pub use buffer::EventBuffer;
pub use config::{
    StreamConfig, BASE_RETRY_DELAY, DEFAULT_STREAM_URL, EVENT_BUFFER_CAPACITY, MAX_EVENT_SIZE,
    MAX_RETRIES, MAX_RETRY_DELAY,
};
pub use event::{ConnectionStatus, StreamEvent, StreamSnapshot, Visibility};
pub use machine::{Effect, Generation, Input, StreamMachine};
pub use manager::{EventStreamManager, StreamHandle};
pub use notify::{Notifier, Silent, TerminalBell};
pub use sse::{SseDecoder, SseFrame};
pub use transport::{SessionCookie, SseTransport, Transport, TransportEvent};
