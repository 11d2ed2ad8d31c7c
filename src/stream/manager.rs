//! Event stream manager with auto-reconnect
//!
//! One actor task owns the [`StreamMachine`], the live transport task and
//! the retry timer. Consumers hold a cloneable [`StreamHandle`]: snapshots
//! fan out through a `watch` channel, requests go in through a command
//! channel, so only the actor ever mutates stream state.

use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use super::config::StreamConfig;
use super::event::{StreamEvent, StreamSnapshot, Visibility};
use super::machine::{Effect, Generation, Input, StreamMachine};
use super::notify::Notifier;
use super::transport::{SessionCookie, Transport, TransportEvent};

enum Command {
    Input(Input),
    Shutdown(oneshot::Sender<()>),
}

pub struct EventStreamManager {
    machine: StreamMachine,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    session: Option<SessionCookie>,
    state_tx: watch::Sender<StreamSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::UnboundedSender<Input>,
    transport_rx: mpsc::UnboundedReceiver<Input>,
    live: Option<JoinHandle<()>>,
    retry: Option<Pin<Box<Sleep>>>,
}

impl EventStreamManager {
    /// Start the manager on the current tokio runtime and connect immediately
    pub fn spawn(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        session: Option<SessionCookie>,
    ) -> StreamHandle {
        let machine = StreamMachine::new(config);
        let (state_tx, state_rx) = watch::channel(machine.snapshot());
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let manager = Self {
            machine,
            transport,
            notifier,
            session,
            state_tx,
            commands,
            transport_tx,
            transport_rx,
            live: None,
            retry: None,
        };
        tokio::spawn(manager.run());

        StreamHandle {
            commands: command_tx,
            state: state_rx,
        }
    }

    async fn run(mut self) {
        self.apply(Input::Connect);

        loop {
            let retry_armed = self.retry.is_some();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Input(input)) => self.apply(input),
                    Some(Command::Shutdown(ack)) => {
                        self.apply(Input::Shutdown);
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        debug!("All stream handles dropped");
                        self.apply(Input::Shutdown);
                        break;
                    }
                },
                Some(input) = self.transport_rx.recv() => self.apply(input),
                () = retry_elapsed(&mut self.retry), if retry_armed => {
                    self.retry = None;
                    self.apply(Input::RetryElapsed);
                }
            }
        }

        info!("Event stream manager stopped");
    }

    fn apply(&mut self, input: Input) {
        let mut publish = false;

        for effect in self.machine.handle(input) {
            match effect {
                Effect::CloseTransport => {
                    if let Some(task) = self.live.take() {
                        task.abort();
                    }
                }
                Effect::OpenTransport { generation } => {
                    self.live = Some(self.open_transport(generation));
                }
                Effect::CancelRetry => self.retry = None,
                Effect::ScheduleRetry { delay } => {
                    self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Effect::Notify(event) => self.notify(&event),
                Effect::Publish => publish = true,
            }
        }

        if publish {
            self.state_tx.send_replace(self.machine.snapshot());
        }
    }

    fn open_transport(&self, generation: Generation) -> JoinHandle<()> {
        let mut events = self.transport.open(self.session.as_ref());
        let tx = self.transport_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let input = match event {
                    TransportEvent::Opened => Input::Opened { generation },
                    TransportEvent::Frame(data) => Input::Frame { generation, data },
                    TransportEvent::Failed(reason) => {
                        let _ = tx.send(Input::Failed { generation, reason });
                        return;
                    }
                };
                if tx.send(input).is_err() {
                    return;
                }
            }

            let _ = tx.send(Input::Failed {
                generation,
                reason: "Server closed the stream".to_string(),
            });
        })
    }

    fn notify(&self, event: &StreamEvent) {
        if let Err(e) = self.notifier.notify(event) {
            warn!("Event notification failed: {:#}", e);
        }
    }
}

impl Drop for EventStreamManager {
    fn drop(&mut self) {
        if let Some(task) = self.live.take() {
            task.abort();
        }
    }
}

async fn retry_elapsed(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Consumer handle: read-only snapshots plus the public stream operations
#[derive(Clone)]
pub struct StreamHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<StreamSnapshot>,
}

impl StreamHandle {
    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<StreamSnapshot> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn retry_count(&self) -> u32 {
        self.state.borrow().retry_count
    }

    /// Newest first
    pub fn events(&self) -> Vec<StreamEvent> {
        self.state.borrow().events.clone()
    }

    /// Re-establish the transport, closing any existing one first
    pub fn connect(&self) {
        self.send(Input::Connect);
    }

    /// Manual recovery: reset the retry budget and connect immediately
    pub fn reconnect(&self) {
        self.send(Input::Reconnect);
    }

    pub fn clear_events(&self) {
        self.send(Input::ClearEvents);
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.send(Input::VisibilityChanged(visibility));
    }

    /// Tear down: cancel the retry timer and close the transport
    ///
    /// Resolves once the manager has stopped. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn send(&self, input: Input) {
        if self.commands.send(Command::Input(input)).is_err() {
            debug!("Stream manager already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::ConnectionStatus;
    use crate::stream::notify::Silent;
    use futures::stream::{self, BoxStream};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Scripted behaviour for one connection attempt
    enum Attempt {
        /// Handshake fails
        Fail,
        /// Opens, delivers frames, stays open
        Open(Vec<String>),
        /// Opens, delivers frames, then the server closes
        OpenThenClose(Vec<String>),
    }

    struct LiveGuard(Arc<AtomicUsize>);

    impl Drop for LiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockTransport {
        script: Mutex<VecDeque<Attempt>>,
        attempts: Mutex<Vec<Instant>>,
        sessions: Mutex<Vec<Option<SessionCookie>>>,
        live: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn new(script: Vec<Attempt>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }

        fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn open(&self, session: Option<&SessionCookie>) -> BoxStream<'static, TransportEvent> {
            self.attempts.lock().unwrap().push(Instant::now());
            self.sessions.lock().unwrap().push(session.cloned());
            self.live.fetch_add(1, Ordering::SeqCst);
            let guard = LiveGuard(self.live.clone());

            let attempt = self.script.lock().unwrap().pop_front().unwrap_or(Attempt::Fail);
            let events: BoxStream<'static, TransportEvent> = match attempt {
                Attempt::Fail => {
                    stream::iter(vec![TransportEvent::Failed("connection refused".into())]).boxed()
                }
                Attempt::Open(frames) => stream::iter(opened(frames))
                    .chain(stream::pending())
                    .boxed(),
                Attempt::OpenThenClose(frames) => stream::iter(opened(frames)).boxed(),
            };

            events
                .map(move |event| {
                    let _live = &guard;
                    event
                })
                .boxed()
        }
    }

    fn opened(frames: Vec<String>) -> Vec<TransportEvent> {
        std::iter::once(TransportEvent::Opened)
            .chain(frames.into_iter().map(TransportEvent::Frame))
            .collect()
    }

    fn spawn(transport: Arc<MockTransport>) -> StreamHandle {
        EventStreamManager::spawn(StreamConfig::default(), transport, Arc::new(Silent), None)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_start() {
        let transport = MockTransport::new(vec![Attempt::Open(vec![])]);
        let handle = spawn(transport.clone());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.events.is_empty());
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_events() {
        let transport = MockTransport::new(vec![Attempt::Open(vec![
            r#"{"symbol":"AAPL","type":"bullish"}"#.to_string(),
        ])]);
        let handle = spawn(transport);

        let mut rx = handle.subscribe();
        rx.wait_for(|s| !s.events.is_empty()).await.unwrap();

        let events = handle.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({"symbol": "AAPL", "type": "bullish"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_does_not_disrupt_stream() {
        let transport = MockTransport::new(vec![Attempt::Open(vec![
            r#"{"seq":1}"#.to_string(),
            "<html>oops</html>".to_string(),
            r#"{"seq":2}"#.to_string(),
        ])]);
        let handle = spawn(transport.clone());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.events.len() == 2).await.unwrap();

        assert!(handle.is_connected());
        assert_eq!(handle.events()[0].payload["seq"], 2);
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_triggers_backoff_reconnect() {
        let transport = MockTransport::new(vec![
            Attempt::OpenThenClose(vec![]),
            Attempt::Open(vec![]),
        ]);
        let handle = spawn(transport.clone());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.status == ConnectionStatus::Disconnected && transport.attempts().len() == 1)
            .await
            .unwrap();

        rx.wait_for(|s| s.is_connected() && transport.attempts().len() == 2)
            .await
            .unwrap();

        let attempts = transport.attempts();
        assert!(attempts[1] - attempts[0] >= Duration::from_millis(1000));
        assert!(attempts[1] - attempts[0] < Duration::from_millis(2000));
        // Successful open clears the retry counter
        assert_eq!(handle.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_max_retries() {
        let transport = MockTransport::new(vec![]);
        let handle = spawn(transport.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;

        // Initial attempt plus five automatic retries
        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 6);
        let gaps: Vec<u128> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 10000]);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert_eq!(snapshot.retry_count, 5);

        // Manual reconnect starts a new attempt with no backoff
        handle.reconnect();
        settle().await;
        assert_eq!(transport.attempts().len(), 7);
        assert_eq!(handle.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_events_keeps_connection() {
        let frames = (0..30).map(|seq| json!({ "seq": seq }).to_string()).collect();
        let transport = MockTransport::new(vec![Attempt::Open(frames)]);
        let handle = spawn(transport);

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.events.len() == 30).await.unwrap();

        handle.clear_events();
        rx.wait_for(|s| s.events.is_empty()).await.unwrap();
        assert!(handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_regain_reconnects() {
        let mut script: Vec<Attempt> = (0..6).map(|_| Attempt::Fail).collect();
        script.push(Attempt::Open(vec![]));
        let transport = MockTransport::new(script);
        let handle = spawn(transport.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!handle.is_connected());
        assert_eq!(transport.attempts().len(), 6);

        handle.set_visibility(Visibility::Hidden);
        settle().await;
        assert_eq!(transport.attempts().len(), 6);

        handle.set_visibility(Visibility::Visible);
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.is_connected()).await.unwrap();
        assert_eq!(transport.attempts().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_keeps_single_transport() {
        let transport = MockTransport::new(vec![Attempt::Open(vec![]), Attempt::Open(vec![])]);
        let handle = spawn(transport.clone());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.is_connected()).await.unwrap();
        assert_eq!(transport.live(), 1);

        handle.connect();
        settle().await;
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        assert_eq!(transport.attempts().len(), 2);
        assert_eq!(transport.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_during_backoff_disarms_timer() {
        let transport = MockTransport::new(vec![
            Attempt::OpenThenClose(vec![]),
            Attempt::Open(vec![]),
        ]);
        let handle = spawn(transport.clone());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.status == ConnectionStatus::Disconnected && transport.attempts().len() == 1)
            .await
            .unwrap();

        // Backoff timer is armed; connect explicitly before it fires
        handle.connect();
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.attempts().len(), 2);
        assert!(handle.is_connected());
        assert_eq!(handle.retry_count(), 0);
        assert_eq!(transport.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_transport_and_timer() {
        let transport = MockTransport::new(vec![Attempt::OpenThenClose(vec![])]);
        let handle = spawn(transport.clone());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.status == ConnectionStatus::Disconnected && transport.attempts().len() == 1)
            .await
            .unwrap();

        // Retry timer is armed; tear down before it fires
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(transport.live(), 0);

        // Requests after teardown are ignored
        handle.reconnect();
        handle.shutdown().await;
        settle().await;
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_open_transport() {
        let transport = MockTransport::new(vec![Attempt::Open(vec![])]);
        let handle = spawn(transport.clone());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        handle.shutdown().await;
        settle().await;

        assert_eq!(transport.live(), 0);
        assert!(!handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_sees_final_snapshot_then_closes() {
        let transport = MockTransport::new(vec![Attempt::Open(vec![])]);
        let handle = spawn(transport.clone());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        handle.shutdown().await;
        drop(handle);

        // Same loop shape as the CLI printer: it must end, and only after the last status
        let mut last = rx.borrow_and_update().clone();
        while rx.changed().await.is_ok() {
            last = rx.borrow_and_update().clone();
        }
        assert_eq!(last.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifier_failure_is_swallowed() {
        struct Broken;
        impl Notifier for Broken {
            fn notify(&self, _event: &StreamEvent) -> anyhow::Result<()> {
                anyhow::bail!("no audio device")
            }
        }

        let transport = MockTransport::new(vec![Attempt::Open(vec![r#"{"seq":1}"#.to_string()])]);
        let handle = EventStreamManager::spawn(
            StreamConfig::default(),
            transport,
            Arc::new(Broken),
            None,
        );

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.events.len() == 1).await.unwrap();
        assert!(handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_passed_to_transport() {
        let transport = MockTransport::new(vec![Attempt::Open(vec![])]);
        let handle = EventStreamManager::spawn(
            StreamConfig::default(),
            transport.clone(),
            Arc::new(Silent),
            Some(SessionCookie::new("session=abc")),
        );

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        let sessions = transport.sessions.lock().unwrap();
        assert_eq!(sessions[0], Some(SessionCookie::new("session=abc")));
    }
}
