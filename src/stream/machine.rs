//! Connection state machine
//!
//! Pure transition logic: every transport callback, timer expiry and
//! consumer request is an [`Input`]; the machine updates its state and
//! returns the [`Effect`]s the driver must perform, in order. No I/O or
//! timers live here, so the reconnect policy is testable synchronously.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::buffer::EventBuffer;
use super::config::StreamConfig;
use super::event::{ConnectionStatus, StreamEvent, StreamSnapshot, Visibility};

/// Identifies one transport instance; bumped on every connect
pub type Generation = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Connect,
    Opened { generation: Generation },
    Frame { generation: Generation, data: String },
    Failed { generation: Generation, reason: String },
    RetryElapsed,
    Reconnect,
    ClearEvents,
    VisibilityChanged(Visibility),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Drop the live transport, if any
    CloseTransport,
    /// Start a new transport tagged with `generation`
    OpenTransport { generation: Generation },
    /// Drop the pending retry timer, if any
    CancelRetry,
    /// Arm the (single) retry timer
    ScheduleRetry { delay: Duration },
    /// Best-effort notification for a received event
    Notify(StreamEvent),
    /// Consumer-visible state changed
    Publish,
}

pub struct StreamMachine {
    config: StreamConfig,
    status: ConnectionStatus,
    retry_count: u32,
    buffer: EventBuffer,
    generation: Generation,
    transport_live: bool,
    retry_pending: bool,
    visibility: Visibility,
    shut_down: bool,
}

impl StreamMachine {
    pub fn new(config: StreamConfig) -> Self {
        let buffer = EventBuffer::new(config.buffer_capacity);
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            buffer,
            generation: 0,
            transport_live: false,
            retry_pending: false,
            visibility: Visibility::Visible,
            shut_down: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn is_transport_live(&self) -> bool {
        self.transport_live
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            events: self.buffer.to_vec(),
            status: self.status,
            retry_count: self.retry_count,
        }
    }

    /// Apply one input, returning the effects to perform in order
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        if self.shut_down {
            debug!("Ignoring {:?} after shutdown", input);
            return Vec::new();
        }

        let mut effects = Vec::new();
        match input {
            Input::Connect => self.connect(&mut effects),
            Input::Opened { generation } => {
                if self.is_current(generation) {
                    self.on_open(&mut effects);
                }
            }
            Input::Frame { generation, data } => {
                if self.is_current(generation) {
                    self.on_message(&data, &mut effects);
                }
            }
            Input::Failed { generation, reason } => {
                if self.is_current(generation) {
                    self.on_error(&reason, &mut effects);
                }
            }
            Input::RetryElapsed => {
                if self.retry_pending {
                    self.retry_pending = false;
                    self.retry_count += 1;
                    self.connect(&mut effects);
                }
            }
            Input::Reconnect => self.reconnect(&mut effects),
            Input::ClearEvents => {
                self.buffer.clear();
                effects.push(Effect::Publish);
            }
            Input::VisibilityChanged(visibility) => {
                self.visibility = visibility;
                if visibility == Visibility::Visible && !self.status.is_connected() {
                    info!("Visible again while {}, reconnecting", self.status);
                    self.reconnect(&mut effects);
                }
            }
            Input::Shutdown => {
                self.shut_down = true;
                self.cancel_retry(&mut effects);
                self.close_transport(&mut effects);
                self.status = ConnectionStatus::Disconnected;
                effects.push(Effect::Publish);
            }
        }
        effects
    }

    fn is_current(&self, generation: Generation) -> bool {
        if self.transport_live && generation == self.generation {
            return true;
        }
        debug!(
            "Dropping event from stale transport {} (current {})",
            generation, self.generation
        );
        false
    }

    fn connect(&mut self, effects: &mut Vec<Effect>) {
        self.cancel_retry(effects);
        self.close_transport(effects);
        self.generation += 1;
        self.transport_live = true;
        self.status = ConnectionStatus::Connecting;
        info!(
            "Connecting to {} (transport {}, retry {})",
            self.config.url, self.generation, self.retry_count
        );
        effects.push(Effect::OpenTransport {
            generation: self.generation,
        });
        effects.push(Effect::Publish);
    }

    fn on_open(&mut self, effects: &mut Vec<Effect>) {
        info!("Event stream connected");
        self.status = ConnectionStatus::Connected;
        self.retry_count = 0;
        effects.push(Effect::Publish);
    }

    fn on_message(&mut self, data: &str, effects: &mut Vec<Effect>) {
        match StreamEvent::parse(data) {
            Ok(event) => {
                debug!("Received event: {}", data);
                self.buffer.push(event.clone());
                effects.push(Effect::Notify(event));
                effects.push(Effect::Publish);
            }
            Err(e) => {
                error!("Failed to parse stream message: {}", e);
                debug!("Raw message: {}", data);
            }
        }
    }

    fn on_error(&mut self, reason: &str, effects: &mut Vec<Effect>) {
        warn!("Event stream error: {}", reason);
        self.status = ConnectionStatus::Disconnected;
        self.close_transport(effects);
        self.cancel_retry(effects);

        if self.retry_count < self.config.max_retries {
            let delay = self.config.retry_delay(self.retry_count);
            warn!(
                "Reconnecting (attempt {}/{}) in {:?}...",
                self.retry_count + 1,
                self.config.max_retries,
                delay
            );
            self.retry_pending = true;
            effects.push(Effect::ScheduleRetry { delay });
        } else {
            error!(
                "Max reconnect attempts ({}) exceeded, waiting for manual reconnect",
                self.config.max_retries
            );
        }
        effects.push(Effect::Publish);
    }

    fn reconnect(&mut self, effects: &mut Vec<Effect>) {
        self.cancel_retry(effects);
        self.close_transport(effects);
        self.retry_count = 0;
        self.connect(effects);
    }

    fn close_transport(&mut self, effects: &mut Vec<Effect>) {
        if self.transport_live {
            self.transport_live = false;
            effects.push(Effect::CloseTransport);
        }
    }

    fn cancel_retry(&mut self, effects: &mut Vec<Effect>) {
        if self.retry_pending {
            self.retry_pending = false;
            effects.push(Effect::CancelRetry);
        }
    }
}
