//! `text/event-stream` decoder
//!
//! Incremental: HTTP body chunks can split lines (and UTF-8 sequences)
//! anywhere, so bytes are held until a line terminator arrives.

use std::mem;

use anyhow::{bail, Result};

use super::config::MAX_EVENT_SIZE;

/// One dispatched server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, `None` for the default "message" type
    pub event: Option<String>,
    /// `data:` lines joined with '\n'
    pub data: String,
    /// Last seen `id:` field
    pub id: Option<String>,
    /// `retry:` hint in milliseconds
    pub retry: Option<u64>,
}

impl SseFrame {
    /// Whether this frame would reach a browser `onmessage` handler
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("") | Some("message"))
    }
}

#[derive(Debug)]
pub struct SseDecoder {
    max_event_size: usize,
    line: Vec<u8>,
    skip_lf: bool,
    started: bool,
    event: Option<String>,
    data: String,
    last_event_id: Option<String>,
    retry: Option<u64>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_event_size(MAX_EVENT_SIZE)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max_event_size` bounds the bytes held for one pending event
    pub fn with_max_event_size(max_event_size: usize) -> Self {
        Self {
            max_event_size,
            line: Vec::new(),
            skip_lf: false,
            started: false,
            event: None,
            data: String::new(),
            last_event_id: None,
            retry: None,
        }
    }

    /// Feed a body chunk, returning every frame it completes
    ///
    /// Fails once a pending event grows past the size limit; the decoder
    /// should be dropped with its connection after that.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if mem::take(&mut self.skip_lf) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\r' => {
                    self.skip_lf = true;
                    self.end_line(&mut frames);
                }
                b'\n' => self.end_line(&mut frames),
                _ => {
                    self.line.push(byte);
                    if self.line.len() + self.data.len() > self.max_event_size {
                        bail!(
                            "Event exceeds {} bytes without a terminator",
                            self.max_event_size
                        );
                    }
                }
            }
        }

        Ok(frames)
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        let raw = mem::take(&mut self.line);
        let mut line = String::from_utf8_lossy(&raw).into_owned();

        if !self.started {
            self.started = true;
            if let Some(stripped) = line.strip_prefix('\u{feff}') {
                line = stripped.to_string();
            }
        }

        if line.is_empty() {
            if let Some(frame) = self.dispatch() {
                frames.push(frame);
            }
            return;
        }

        // Comment / heartbeat
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };

        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return None;
        }

        let mut data = mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }

        Some(SseFrame {
            event,
            data,
            id: self.last_event_id.clone(),
            retry,
        })
    }
}
