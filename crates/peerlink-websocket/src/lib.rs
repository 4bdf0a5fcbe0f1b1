//! Client WebSocket endpoint over a layered transport stack
//!
//! This crate provides the user-facing WebSocket client of the peerlink
//! stack. A connection is assembled layer by layer (TCP, then TLS for
//! `wss://` URLs, then RFC 6455 framing via tokio-tungstenite), with each
//! layer reporting its lifecycle through the state callbacks defined in
//! `peerlink-transport`. The endpoint ties the layers together under a
//! single four-state lifecycle (Closed, Connecting, Open, Closing), queues
//! inbound application messages with byte-accounted backpressure, and tears
//! the whole stack down from any layer's failure without leaking sockets.
//!
//! # Example
//!
//! ```no_run
//! use peerlink_websocket::{WebSocket, WebSocketConfig};
//!
//! # async fn run() -> Result<(), peerlink_websocket::Error> {
//! let ws = WebSocket::new(WebSocketConfig::default())?;
//! ws.on_open(|| println!("open"));
//! ws.on_message(|msg| println!("got {:?}", msg));
//! ws.open("wss://example.com/feed")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod message;
pub mod queue;
pub mod url;
pub mod websocket;

mod callback;
mod stream;
mod tcp;
mod tls;
mod ws;

pub use crate::config::{WebSocketConfig, DEFAULT_MAX_MESSAGE_SIZE};
pub use crate::message::Message;
pub use crate::url::WsUrl;
pub use crate::websocket::{Error, State, WebSocket};

pub use peerlink_transport::{Transport, TransportError, TransportState};
