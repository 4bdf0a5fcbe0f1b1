//! TLS transport layer

use bytes::Bytes;
use peerlink_transport::{
    StateCallback, StateCell, Transport, TransportError, TransportResult, TransportState,
};
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use async_trait::async_trait;

use crate::tcp::TcpTransport;

/// TLS layer over an established TCP transport. `hostname` is the SNI name
/// presented during the handshake.
///
/// Peer verification is decided by the connector this layer is given: the
/// stack builder supplies a root-store-validating connector or a
/// non-validating one depending on the endpoint configuration.
pub(crate) struct TlsTransport {
    lower: Arc<TcpTransport>,
    hostname: String,
    connector: TlsConnector,
    state: StateCell,
    stream: Mutex<Option<tokio_rustls::client::TlsStream<TcpStream>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    handle: Handle,
}

impl TlsTransport {
    pub(crate) fn new(
        lower: Arc<TcpTransport>,
        hostname: String,
        connector: TlsConnector,
        callback: StateCallback,
        handle: Handle,
    ) -> Arc<Self> {
        debug!("Initializing TLS transport");
        Arc::new(Self {
            lower,
            hostname,
            connector,
            state: StateCell::new(callback),
            stream: Mutex::new(None),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
            handle,
        })
    }

    /// Hand the negotiated stream to the layer above.
    pub(crate) fn take_stream(&self) -> Option<tokio_rustls::client::TlsStream<TcpStream>> {
        self.stream.lock().unwrap().take()
    }

    async fn run(self: Arc<Self>) {
        self.state.change(TransportState::Connecting);

        let Some(tcp_stream) = self.lower.take_stream() else {
            warn!("TLS transport started without an established TCP stream");
            self.state.change(TransportState::Failed);
            return;
        };

        let server_name = match ServerName::try_from(self.hostname.clone()) {
            Ok(name) => name,
            Err(e) => {
                warn!("Invalid server name \"{}\": {}", self.hostname, e);
                self.state.change(TransportState::Failed);
                return;
            }
        };

        match self.connector.connect(server_name, tcp_stream).await {
            Ok(stream) => {
                *self.stream.lock().unwrap() = Some(stream);
                if self.stopped.load(Ordering::SeqCst) {
                    self.stream.lock().unwrap().take();
                    return;
                }
                debug!("TLS handshake complete with {}", self.hostname);
                self.state.change(TransportState::Connected);
            }
            Err(e) => {
                warn!("TLS handshake with {} failed: {}", self.hostname, e);
                self.state.change(TransportState::Failed);
            }
        }
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn start(self: Arc<Self>) -> TransportResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "TLS transport already stopped".to_string(),
            ));
        }
        debug!("Starting TLS transport");
        let task = self.handle.clone().spawn(self.clone().run());
        *self.task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn stop(self: Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        if self.stream.lock().unwrap().take().is_some() {
            debug!("Closing TLS stream");
        }
    }

    // Raw writes would bypass the record layer; frames go through the
    // WebSocket layer once it absorbs this stream.
    fn send(&self, _data: Bytes) -> TransportResult<bool> {
        Ok(false)
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("hostname", &self.hostname)
            .field("state", &self.state.get())
            .finish()
    }
}
