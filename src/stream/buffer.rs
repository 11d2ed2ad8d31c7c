use std::collections::VecDeque;

use super::event::StreamEvent;

/// Bounded, newest-first log of received events
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: VecDeque<StreamEvent>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert at the front, evicting the oldest event once over capacity
    pub fn push(&mut self, event: StreamEvent) {
        self.events.push_front(event);
        self.events.truncate(self.capacity);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter()
    }

    pub fn to_vec(&self) -> Vec<StreamEvent> {
        self.events.iter().cloned().collect()
    }
}
