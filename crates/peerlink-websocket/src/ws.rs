//! WebSocket framing layer, driven through tokio-tungstenite

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerlink_transport::{
    StateCallback, StateCell, Transport, TransportError, TransportResult, TransportState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as FramingConfig;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use async_trait::async_trait;

use crate::message::Message;
use crate::stream::MaybeTlsStream;

type WsStream = WebSocketStream<MaybeTlsStream>;

/// Outbound frames queued between `send` and the writer task.
const OUTGOING_QUEUE_CAPACITY: usize = 256;

/// Handshake parameters for the framing layer.
#[derive(Debug, Clone)]
pub(crate) struct WsConfig {
    /// `Host` header value.
    pub host: String,
    /// Request path including the query string.
    pub path: String,
    /// Subprotocols offered via `Sec-WebSocket-Protocol`.
    pub protocols: Vec<String>,
    /// Inbound message size cap handed to the framing codec.
    pub max_message_size: usize,
    pub ping_interval: Option<Duration>,
    pub max_outstanding_pings: Option<usize>,
}

/// Delivers framed application messages upward; `None` signals that the
/// remote closed the session.
pub(crate) type MessageCallback = Arc<dyn Fn(Option<Message>) + Send + Sync>;

/// Top layer of the stack: performs the RFC 6455 client handshake over the
/// byte stream the lower layers produced, then pumps messages both ways.
pub(crate) struct WsTransport {
    config: WsConfig,
    message_callback: MessageCallback,
    state: StateCell,
    lower: Mutex<Option<MaybeTlsStream>>,
    outgoing: Mutex<Option<mpsc::Sender<Frame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    outstanding_pings: AtomicUsize,
    stopped: AtomicBool,
    handle: Handle,
}

impl WsTransport {
    pub(crate) fn new(
        lower: MaybeTlsStream,
        config: WsConfig,
        message_callback: MessageCallback,
        state_callback: StateCallback,
        handle: Handle,
    ) -> Arc<Self> {
        debug!("Initializing WebSocket transport");
        Arc::new(Self {
            config,
            message_callback,
            state: StateCell::new(state_callback),
            lower: Mutex::new(Some(lower)),
            outgoing: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            outstanding_pings: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            handle,
        })
    }

    /// Queue an application message for sending. Returns whether it was
    /// admitted; a full outbound queue refuses admission.
    pub(crate) fn send_message(&self, message: Message) -> TransportResult<bool> {
        let frame = match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data.to_vec()),
            // Control frames belong to the framing layer.
            Message::Control(_) => return Ok(false),
        };

        let guard = self.outgoing.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return Ok(false);
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::ConnectionError(
                "WebSocket writer is gone".to_string(),
            )),
        }
    }

    /// Begin the closing handshake. Before the handshake has completed
    /// there is no session to close, so the layer reports Disconnected and
    /// lets the owner tear the stack down.
    pub(crate) fn close(&self) {
        let queued = {
            let guard = self.outgoing.lock().unwrap();
            match guard.as_ref() {
                Some(tx) => tx.try_send(Frame::Close(None)).is_ok(),
                None => false,
            }
        };
        if queued {
            debug!("WebSocket close frame queued");
        } else {
            self.state.change(TransportState::Disconnected);
        }
    }

    async fn run(self: Arc<Self>) {
        self.state.change(TransportState::Connecting);

        let Some(stream) = self.lower.lock().unwrap().take() else {
            warn!("WebSocket transport started without a byte stream");
            self.state.change(TransportState::Failed);
            return;
        };

        let request = match self.build_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("WebSocket request build failed: {}", e);
                self.state.change(TransportState::Failed);
                return;
            }
        };

        let mut framing = FramingConfig::default();
        framing.max_message_size = Some(self.config.max_message_size);
        framing.max_frame_size = Some(self.config.max_message_size);

        let ws_stream =
            match tokio_tungstenite::client_async_with_config(request, stream, Some(framing)).await
            {
                Ok((ws_stream, _response)) => ws_stream,
                Err(e) => {
                    warn!("WebSocket handshake failed: {}", e);
                    self.state.change(TransportState::Failed);
                    return;
                }
            };

        debug!("WebSocket handshake complete with {}", self.config.host);

        let (out_tx, out_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        *self.outgoing.lock().unwrap() = Some(out_tx.clone());
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        // Connected must be reported before the reader can deliver the
        // first message.
        self.state.change(TransportState::Connected);

        let (sink, source) = ws_stream.split();
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.handle.spawn(Self::write_loop(sink, out_rx)));
        tasks.push(self.handle.spawn(self.clone().read_loop(source)));
        if let Some(period) = self.config.ping_interval {
            tasks.push(self.handle.spawn(self.clone().ping_loop(out_tx, period)));
        }

        // stop() may have drained the task list while the handshake was
        // still in flight; anything registered after that must go down too.
        if self.stopped.load(Ordering::SeqCst) {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn build_request(
        &self,
    ) -> TransportResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let uri = format!("ws://{}{}", self.config.host, self.config.path);
        let mut request = uri
            .into_client_request()
            .map_err(|e| TransportError::ProtocolError(format!("Invalid request: {}", e)))?;

        if !self.config.protocols.is_empty() {
            let offered = self.config.protocols.join(", ");
            let value = HeaderValue::from_str(&offered).map_err(|e| {
                TransportError::ProtocolError(format!("Invalid subprotocol list: {}", e))
            })?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        Ok(request)
    }

    async fn read_loop(self: Arc<Self>, mut source: SplitStream<WsStream>) {
        while let Some(next) = source.next().await {
            match next {
                Ok(Frame::Text(text)) => (self.message_callback)(Some(Message::Text(text))),
                Ok(Frame::Binary(data)) => {
                    (self.message_callback)(Some(Message::Binary(Bytes::from(data))));
                }
                // tungstenite queues the pong reply itself.
                Ok(Frame::Ping(_)) => {}
                Ok(Frame::Pong(_)) => {
                    self.outstanding_pings.store(0, Ordering::SeqCst);
                }
                Ok(Frame::Close(_)) => {
                    debug!("WebSocket close received");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if !self.stopped.load(Ordering::SeqCst) {
                        warn!("WebSocket read error: {}", e);
                    }
                    break;
                }
            }
        }

        if self.state.change(TransportState::Disconnected) {
            (self.message_callback)(None);
        }
    }

    async fn write_loop(mut sink: SplitSink<WsStream, Frame>, mut out_rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = out_rx.recv().await {
            let closing = matches!(frame, Frame::Close(_));
            if sink.send(frame).await.is_err() {
                break;
            }
            if closing {
                // The session ends on the read side once the peer answers.
                break;
            }
        }
        let _ = sink.close().await;
    }

    async fn ping_loop(self: Arc<Self>, out_tx: mpsc::Sender<Frame>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // immediate first tick

        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::SeqCst)
                || self.state.get() != TransportState::Connected
            {
                break;
            }

            if let Some(limit) = self.config.max_outstanding_pings {
                let outstanding = self.outstanding_pings.load(Ordering::SeqCst);
                if outstanding >= limit {
                    warn!("{} pings unanswered, failing WebSocket", outstanding);
                    self.state.change(TransportState::Failed);
                    break;
                }
            }

            self.outstanding_pings.fetch_add(1, Ordering::SeqCst);
            if out_tx.send(Frame::Ping(Vec::new())).await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn start(self: Arc<Self>) -> TransportResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "WebSocket transport already stopped".to_string(),
            ));
        }
        debug!("Starting WebSocket transport");
        let task = self.handle.clone().spawn(self.clone().run());
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    async fn stop(self: Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping WebSocket transport");
        // Late senders find the queue gone and get a refusal.
        *self.outgoing.lock().unwrap() = None;
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    fn send(&self, data: Bytes) -> TransportResult<bool> {
        self.send_message(Message::Binary(data))
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("host", &self.config.host)
            .field("path", &self.config.path)
            .field("state", &self.state.get())
            .finish()
    }
}
