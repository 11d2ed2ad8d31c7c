// Library crate - exports the alert stream client

pub mod stream;

// Re-export commonly used types
pub use stream::{
    ConnectionStatus, EventStreamManager, SessionCookie, SseTransport, StreamConfig, StreamEvent,
    StreamHandle, StreamSnapshot, Visibility,
};
