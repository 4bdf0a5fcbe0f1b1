//! Minimal WebSocket client example
//!
//! Connects to a WebSocket server, sends a message, and prints whatever
//! comes back until the connection closes.
//!
//! Usage:
//!   cargo run --example echo_client -- \
//!     --url ws://127.0.0.1:9000/ \
//!     --message "hello" \
//!     --insecure

use peerlink_websocket::{Message, WebSocket, WebSocketConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Parse command-line arguments (simple parsing for demo)
    let args: Vec<String> = std::env::args().collect();

    let url = args
        .iter()
        .position(|a| a == "--url")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "ws://127.0.0.1:9000/".to_string());

    let message = args
        .iter()
        .position(|a| a == "--message")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "hello".to_string());

    let insecure = args.iter().any(|a| a == "--insecure");

    let config = if insecure {
        WebSocketConfig::insecure()
    } else {
        WebSocketConfig::default()
    };

    let (open_tx, mut open_rx) = tokio::sync::mpsc::unbounded_channel();
    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();

    let ws = WebSocket::new(config)?;
    ws.on_open(move || {
        let _ = open_tx.send(());
    });
    ws.on_message(|message| match message {
        Message::Text(text) => println!("< {text}"),
        Message::Binary(data) => println!("< ({} bytes)", data.len()),
        Message::Control(_) => {}
    });
    ws.on_error(|reason| eprintln!("error: {reason}"));
    ws.on_closed(move || {
        let _ = closed_tx.send(());
    });

    println!("connecting to {url}");
    ws.open(&url)?;

    tokio::time::timeout(Duration::from_secs(10), open_rx.recv())
        .await
        .map_err(|_| "connection timed out")?
        .ok_or("connection closed before opening")?;
    println!("connected, sending {message:?}");
    ws.send_text(message)?;

    // Stream replies until the server closes or ctrl-c.
    tokio::select! {
        _ = closed_rx.recv() => println!("connection closed"),
        _ = tokio::signal::ctrl_c() => {
            println!("closing");
            ws.close();
            let _ = closed_rx.recv().await;
        }
    }

    Ok(())
}
