//! Stream transports
//!
//! A transport turns one connection attempt into a stream of
//! [`TransportEvent`]s. The manager owns the retry policy; a transport
//! never reconnects on its own.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, COOKIE};
use reqwest::Client;
use tracing::debug;

use super::config::StreamConfig;
use super::sse::SseDecoder;

/// Events produced by a single connection attempt
///
/// A stream that ends without `Failed` means the server closed the
/// connection, which the manager handles like a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake succeeded, the stream is live
    Opened,
    /// Body of one message frame
    Frame(String),
    /// Handshake or stream failure
    Failed(String),
}

/// Ambient session credential attached to the stream request
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCookie(String);

impl SessionCookie {
    /// `value` is a raw `Cookie` header value, e.g. `session=abc123`
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn header_value(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCookie(<redacted>)")
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Start one connection attempt
    fn open(&self, session: Option<&SessionCookie>) -> BoxStream<'static, TransportEvent>;
}

/// Server-Sent Events over HTTP via reqwest
pub struct SseTransport {
    client: Client,
    url: String,
    handshake_timeout: Duration,
    max_event_size: usize,
}

impl SseTransport {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, config))
    }

    /// Use a preconfigured client; endpoint and limits still come from `config`
    pub fn with_client(client: Client, config: &StreamConfig) -> Self {
        Self {
            client,
            url: config.url.clone(),
            handshake_timeout: config.connect_timeout,
            max_event_size: config.max_event_size,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for SseTransport {
    fn open(&self, session: Option<&SessionCookie>) -> BoxStream<'static, TransportEvent> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(session) = session {
            request = request.header(COOKIE, session.header_value());
        }

        let url = self.url.clone();
        let handshake_timeout = self.handshake_timeout;
        let max_event_size = self.max_event_size;
        let attempt = async move {
            // Bounds the wait for response headers only, never the open stream
            let sent = match tokio::time::timeout(handshake_timeout, request.send()).await {
                Ok(sent) => sent,
                Err(_) => {
                    return stream::once(future::ready(TransportEvent::Failed(format!(
                        "Stream handshake with {} timed out after {:?}",
                        url, handshake_timeout
                    ))))
                    .boxed();
                }
            };
            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    return stream::once(future::ready(TransportEvent::Failed(format!(
                        "Failed to connect to {}: {}",
                        url, e
                    ))))
                    .boxed();
                }
            };

            let status = response.status();
            if !status.is_success() {
                return stream::once(future::ready(TransportEvent::Failed(format!(
                    "Stream handshake failed with status {}",
                    status
                ))))
                .boxed();
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if !content_type.starts_with("text/event-stream") {
                return stream::once(future::ready(TransportEvent::Failed(format!(
                    "Unexpected content type '{}'",
                    content_type
                ))))
                .boxed();
            }

            debug!("Stream handshake complete ({})", status);

            // After the first failure the state is gone and the body is never polled again
            let decoder = SseDecoder::with_max_event_size(max_event_size);
            let body = response.bytes_stream().boxed();
            let frames = stream::unfold(Some((body, decoder)), |state| async move {
                let (mut body, mut decoder) = state?;
                let decoded = body
                    .next()
                    .await?
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| decoder.feed(&bytes));
                match decoded {
                    Ok(frames) => {
                        let events = frames
                            .into_iter()
                            .filter_map(|frame| {
                                if frame.is_message() {
                                    Some(TransportEvent::Frame(frame.data))
                                } else {
                                    debug!("Skipping named event '{:?}'", frame.event);
                                    None
                                }
                            })
                            .collect::<Vec<_>>();
                        Some((stream::iter(events), Some((body, decoder))))
                    }
                    Err(e) => {
                        let failed = TransportEvent::Failed(format!("Stream read error: {:#}", e));
                        Some((stream::iter(vec![failed]), None))
                    }
                }
            })
            .flatten();

            stream::once(future::ready(TransportEvent::Opened))
                .chain(frames)
                .boxed()
        };

        stream::once(attempt).flatten().boxed()
    }
}
