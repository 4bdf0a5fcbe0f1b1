//! Transport layer contract for the peerlink connection stack
//!
//! A peerlink connection is built out of stacked transport layers, each one
//! driving the layer below it: a TCP layer at the bottom, an optional TLS
//! layer above it, and a framing layer (WebSocket) on top. This crate holds
//! the contract those layers share so the connection logic never couples to
//! a specific layer implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              WebSocket endpoint              │
//! │        (state machine, stack builder)        │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      │ drives layers through
//!                      ↓
//! ┌─────────────────────────────────────────────┐
//! │         peerlink-transport (this crate)      │
//! │   - Transport          - TransportState      │
//! │   - StateCell          - TransportError      │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      │ implemented by
//!                      ↓
//! ┌───────────────┬───────────────┬─────────────┐
//! │ TcpTransport  │ TlsTransport  │ WsTransport │
//! └───────────────┴───────────────┴─────────────┘
//! ```
//!
//! Layers are started bottom-up: a layer is constructed over its lower
//! neighbour together with a state-change callback, `start()` kicks off its
//! asynchronous connection sequence, and the owner reacts to the reported
//! [`TransportState`] edges to build the next layer up.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Lifecycle of a single transport layer.
///
/// A layer starts out `Disconnected`, reports `Connecting` when its
/// connection sequence begins and `Connected` once the layer is usable.
/// `Disconnected` after `Connected` means the remote side went away;
/// `Failed` means the connection sequence or the layer itself broke.
/// `Completed` is terminal and reported by layers that distinguish a clean
/// protocol-level shutdown from a connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
    Completed = 4,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            3 => TransportState::Failed,
            4 => TransportState::Completed,
            _ => TransportState::Disconnected,
        }
    }
}

/// Callback invoked on every state edge of a transport layer.
///
/// Callbacks run on the layer's own task, so they must not block and must
/// not stop the layer they were invoked from.
pub type StateCallback = Arc<dyn Fn(TransportState) + Send + Sync>;

/// Edge-triggered state holder shared by all transport layers.
///
/// `change` atomically exchanges the stored state and invokes the callback
/// only when the value actually changed, which makes it safe to call from
/// racing tasks without double-reporting an edge.
pub struct StateCell {
    state: AtomicU8,
    callback: StateCallback,
}

impl StateCell {
    pub fn new(callback: StateCallback) -> Self {
        Self {
            state: AtomicU8::new(TransportState::Disconnected as u8),
            callback,
        }
    }

    pub fn get(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Store `next`, returning whether the state changed. The callback fires
    /// only on an actual change.
    pub fn change(&self, next: TransportState) -> bool {
        let previous = self.state.swap(next as u8, Ordering::AcqRel);
        if previous == next as u8 {
            return false;
        }
        (self.callback)(next);
        true
    }
}

impl Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCell").field("state", &self.get()).finish()
    }
}

/// Contract implemented by every layer of the connection stack.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Begin the layer's asynchronous connection sequence. Returns
    /// immediately; progress is reported through the state callback.
    fn start(self: Arc<Self>) -> TransportResult<()>;

    /// Shut the layer down. Idempotent. Cancels the layer's tasks and
    /// releases its byte stream; must never be called from one of the
    /// layer's own callbacks.
    async fn stop(self: Arc<Self>);

    /// Offer data directly to this layer, returning whether it was
    /// admitted. A mid-stack layer whose byte stream has been absorbed by
    /// the layer above refuses direct sends.
    fn send(&self, data: Bytes) -> TransportResult<bool>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;
}

/// Configuration for transport security
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Optional client certificate for mutual TLS
    pub client_cert: Option<ClientCertificate>,

    /// Custom root CA certificates, DER encoded (system roots when empty)
    pub root_certs: Vec<Vec<u8>>,

    /// Application-Layer Protocol Negotiation (ALPN) protocols
    pub alpn_protocols: Vec<String>,
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self {
            verify_server_cert: true,
            client_cert: None,
            root_certs: Vec::new(),
            alpn_protocols: Vec::new(),
        }
    }
}

/// Client certificate for mutual TLS
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    /// Certificate chain, DER encoded
    pub cert_chain: Vec<Vec<u8>>,

    /// Private key, DER encoded
    pub private_key: Vec<u8>,
}

// Test module with a mock transport implementation
#[cfg(test)]
pub mod tests;
