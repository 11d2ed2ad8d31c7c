use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status of the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        *self == Self::Connected
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// One parsed message from the alert stream
///
/// The payload shape is defined by the backend (alerts, decisions, trades);
/// only valid JSON is required here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub payload: serde_json::Value,
    #[serde(rename = "receivedAt")]
    pub received_at: DateTime<Utc>,
}

impl StreamEvent {
    /// Parse a raw frame body as JSON
    pub fn parse(data: &str) -> serde_json::Result<Self> {
        Ok(Self {
            payload: serde_json::from_str(data)?,
            received_at: Utc::now(),
        })
    }

    /// Convenience accessor for a top-level string field (e.g. "symbol")
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Read-only view of the stream published to consumers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamSnapshot {
    /// Newest first
    pub events: Vec<StreamEvent>,
    pub status: ConnectionStatus,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
}

impl StreamSnapshot {
    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Events received since `previous` was taken, newest first
    ///
    /// Watch receivers coalesce updates, so one change can carry several
    /// new events.
    pub fn events_since<'a>(&'a self, previous: &StreamSnapshot) -> &'a [StreamEvent] {
        let Some(head) = previous.events.first() else {
            return &self.events;
        };
        let fresh = self
            .events
            .iter()
            .position(|event| event == head)
            .unwrap_or(self.events.len());
        &self.events[..fresh]
    }
}

/// Foreground visibility of the consuming UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}
