use anyhow::{Context, Result};
use clap::Parser;
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use screener_stream::stream::{
    EventStreamManager, Notifier, SessionCookie, Silent, SseTransport, StreamConfig, StreamEvent,
    StreamHandle, StreamSnapshot, TerminalBell, Visibility, DEFAULT_STREAM_URL,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Backend SSE endpoint
    #[arg(short, long, env = "SCREENER_STREAM_URL", default_value = DEFAULT_STREAM_URL)]
    url: String,

    /// Session cookie attached to the stream request (e.g. "session=abc123")
    #[arg(long, env = "SCREENER_SESSION_COOKIE", hide_env_values = true)]
    session_cookie: Option<String>,

    /// Timeout in seconds for connecting and receiving response headers
    #[arg(long, default_value = "10")]
    connect_timeout_secs: u64,

    /// Ring the terminal bell for every received event
    #[arg(long)]
    bell: bool,

    /// Print events as raw JSON lines
    #[arg(long)]
    print_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing (stderr, stdout carries events)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("screener_stream=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.connect_timeout_secs == 0 {
        anyhow::bail!("--connect-timeout-secs must be greater than zero");
    }

    info!("Starting screener stream client");
    info!("Endpoint: {}", args.url);
    info!("Session cookie: {}", if args.session_cookie.is_some() { "set" } else { "none" });

    let config = StreamConfig::new(args.url)
        .with_connect_timeout(Duration::from_secs(args.connect_timeout_secs));
    let transport = Arc::new(SseTransport::new(&config)?);
    let notifier: Arc<dyn Notifier> = if args.bell {
        Arc::new(TerminalBell)
    } else {
        Arc::new(Silent)
    };
    let session = args.session_cookie.map(SessionCookie::new);

    let handle = EventStreamManager::spawn(config, transport, notifier, session);
    let printer = tokio::spawn(print_updates(handle.subscribe(), args.print_json));

    info!("Commands: r=reconnect c=clear s=status h=hidden v=visible q=quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Ctrl-C received, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        if !run_command(&handle, line.trim()) {
                            break;
                        }
                    }
                    None => {
                        info!("stdin closed, streaming until Ctrl-C");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    handle.shutdown().await;
    // The printer drains the final snapshot once the manager drops its sender
    drop(handle);
    if let Err(e) = printer.await {
        warn!("Printer task failed: {}", e);
    }

    Ok(())
}

/// Returns false when the operator asked to quit
fn run_command(handle: &StreamHandle, command: &str) -> bool {
    match command {
        "" => {}
        "r" | "reconnect" => {
            info!("Manual reconnect requested");
            handle.reconnect();
        }
        "c" | "clear" => handle.clear_events(),
        "s" | "status" => print_status(&handle.snapshot()),
        "h" | "hide" => handle.set_visibility(Visibility::Hidden),
        "v" | "show" => handle.set_visibility(Visibility::Visible),
        "q" | "quit" => return false,
        other => warn!("Unknown command: {}", other),
    }
    true
}

async fn print_updates(mut rx: watch::Receiver<StreamSnapshot>, json: bool) {
    let mut previous = rx.borrow_and_update().clone();

    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().clone();

        if current.status != previous.status || current.retry_count != previous.retry_count {
            print_status(&current);
        }

        // Oldest first so the terminal reads chronologically
        for event in current.events_since(&previous).iter().rev() {
            print_event(event, json);
        }

        previous = current;
    }
}

fn print_status(snapshot: &StreamSnapshot) {
    if snapshot.is_connected() {
        println!("● {} ({} events)", snapshot.status, snapshot.events.len());
    } else {
        println!(
            "○ {} (retry {}, {} events) - type 'r' to reconnect",
            snapshot.status,
            snapshot.retry_count,
            snapshot.events.len()
        );
    }
}

fn print_event(event: &StreamEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize event: {}", e),
        }
        return;
    }

    println!(
        "[{}] {:<8} {:<10} {}",
        event.received_at.format("%H:%M:%S"),
        event.field_str("symbol").unwrap_or("-"),
        event.field_str("type").unwrap_or("-"),
        event.payload
    );
}
