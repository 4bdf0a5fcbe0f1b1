//! User-facing WebSocket endpoint

use peerlink_transport::{StateCallback, Transport, TransportError, TransportState};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::callback::Callback;
use crate::config::WebSocketConfig;
use crate::message::Message;
use crate::queue::{RecvQueue, RECV_QUEUE_LIMIT};
use crate::stream::MaybeTlsStream;
use crate::tcp::TcpTransport;
use crate::tls::TlsTransport;
use crate::url::WsUrl;
use crate::ws::{MessageCallback, WsConfig, WsTransport};

/// Endpoint errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("WebSocket must be closed before opening")]
    NotClosed,

    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid WebSocket scheme: {0}")]
    InvalidScheme(String),

    #[error("WebSocket is not open")]
    NotOpen,

    #[error("Message size exceeds limit")]
    MessageTooLarge,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("{0} transport initialization failed")]
    TransportInit(&'static str),

    #[error("No tokio runtime available")]
    NoRuntime,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle of the endpoint.
///
/// Transitions run Closed → Connecting → Open → Closing → Closed, and
/// Closed is reachable from any state through failure or teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Closed = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => State::Connecting,
            2 => State::Open,
            3 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Client WebSocket endpoint.
///
/// `open` assembles the transport stack layer by layer and returns before
/// the connection is up; progress and traffic are delivered through the
/// registered event callbacks, which may fire from transport tasks.
/// Inbound application messages also land in an internal byte-bounded
/// queue serviced by [`WebSocket::receive`].
///
/// All operations may be called from any thread. The endpoint must be
/// created while a tokio runtime is reachable; its handle is captured for
/// the lifetime of the endpoint.
pub struct WebSocket {
    inner: Arc<Inner>,
}

struct Inner {
    config: WebSocketConfig,
    url: RwLock<Option<WsUrl>>,
    state: AtomicU8,
    init_mutex: Mutex<()>,
    tcp: RwLock<Option<Arc<TcpTransport>>>,
    tls: RwLock<Option<Arc<TlsTransport>>>,
    ws: RwLock<Option<Arc<WsTransport>>>,
    recv_queue: RecvQueue,
    open_callback: Callback<()>,
    message_callback: Callback<Message>,
    error_callback: Callback<String>,
    closed_callback: Callback<()>,
    available_callback: Callback<usize>,
    weak_self: Weak<Inner>,
    handle: Handle,
}

impl WebSocket {
    /// Create an endpoint with the given configuration.
    ///
    /// Fails when the configuration is invalid or no tokio runtime is
    /// reachable from the calling context.
    pub fn new(config: WebSocketConfig) -> Result<Self, Error> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        debug!("Creating WebSocket");

        let inner = Arc::new_cyclic(|weak| Inner {
            config,
            url: RwLock::new(None),
            state: AtomicU8::new(State::Closed as u8),
            init_mutex: Mutex::new(()),
            tcp: RwLock::new(None),
            tls: RwLock::new(None),
            ws: RwLock::new(None),
            recv_queue: RecvQueue::new(RECV_QUEUE_LIMIT),
            open_callback: Callback::new(),
            message_callback: Callback::new(),
            error_callback: Callback::new(),
            closed_callback: Callback::new(),
            available_callback: Callback::new(),
            weak_self: weak.clone(),
            handle,
        });

        Ok(Self { inner })
    }

    /// Parse the URL and begin connecting. Returns before the connection
    /// is established; `on_open` reports success, `on_error`/`on_closed`
    /// report failure.
    pub fn open(&self, url: &str) -> Result<(), Error> {
        if self.inner.state() != State::Closed {
            return Err(Error::NotClosed);
        }

        let parts = WsUrl::parse(url)?;
        info!(
            "Opening WebSocket to {}://{}:{}{}",
            parts.scheme, parts.hostname, parts.service, parts.path
        );

        if !self.inner.compare_state(State::Closed, State::Connecting) {
            return Err(Error::NotClosed);
        }
        *self.inner.url.write().unwrap() = Some(parts);

        self.inner.init_tcp_transport()?;
        Ok(())
    }

    /// Begin a graceful close. Returns immediately; `on_closed` reports
    /// completion.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Queue an application message for sending.
    ///
    /// Returns whether the message was admitted by the transport; a full
    /// outbound queue refuses admission without error.
    pub fn send(&self, message: impl Into<Message>) -> Result<bool, Error> {
        self.inner.outgoing(message.into())
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<bool, Error> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<bytes::Bytes>) -> Result<bool, Error> {
        self.send(Message::Binary(data.into()))
    }

    /// Pop the next application message, never blocking.
    pub fn receive(&self) -> Option<Message> {
        while let Some(message) = self.inner.recv_queue.try_pop() {
            if message.is_application() {
                return Some(message);
            }
        }
        None
    }

    /// Clone of the next application message, leaving it queued. Control
    /// entries ahead of it are drained.
    pub fn peek(&self) -> Option<Message> {
        while let Some(message) = self.inner.recv_queue.peek() {
            if message.is_application() {
                return Some(message);
            }
            self.inner.recv_queue.try_pop();
        }
        None
    }

    /// Queued inbound payload bytes.
    pub fn available_amount(&self) -> usize {
        self.inner.recv_queue.amount()
    }

    pub fn ready_state(&self) -> State {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state() == State::Open
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state() == State::Closed
    }

    pub fn max_message_size(&self) -> usize {
        self.inner.config.max_message_size
    }

    pub fn on_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.open_callback.set(move |()| handler());
    }

    /// Register the message handler. Messages already queued are delivered
    /// through it immediately, so none are stranded between queue and
    /// callback.
    pub fn on_message(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.inner.message_callback.set(handler);
        self.inner.flush_pending_messages();
    }

    pub fn on_error(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.inner.error_callback.set(handler);
    }

    pub fn on_closed(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.closed_callback.set(move |()| handler());
    }

    /// Register the queue-level notification: fires with the queue length
    /// every time an application message is enqueued.
    pub fn on_available(&self, handler: impl Fn(usize) + Send + Sync + 'static) {
        self.inner.available_callback.set(handler);
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        debug!("Destroying WebSocket");
        self.inner.remote_close();
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Exchange the state, reporting whether it changed. Sole gate for the
    /// user-visible open/closed events.
    fn change_state(&self, next: State) -> bool {
        self.state.swap(next as u8, Ordering::AcqRel) != next as u8
    }

    fn compare_state(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn close(&self) {
        let state = self.state();
        if state == State::Connecting || state == State::Open {
            debug!("Closing WebSocket");
            self.change_state(State::Closing);
            let ws = self.ws.read().unwrap().clone();
            match ws {
                Some(ws) => ws.close(),
                // Nothing to hand the closing handshake to; tear down now
                // so pending lower transports cannot leak.
                None => self.close_transports(),
            }
        }
    }

    fn remote_close(&self) {
        if self.state() != State::Closed {
            self.close();
            self.close_transports();
        }
    }

    fn outgoing(&self, message: Message) -> Result<bool, Error> {
        let ws = self.ws.read().unwrap().clone();
        if self.state() != State::Open {
            return Err(Error::NotOpen);
        }
        let Some(ws) = ws else {
            return Err(Error::NotOpen);
        };

        if message.size() > self.config.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        Ok(ws.send_message(message)?)
    }

    /// Inbound dispatcher: runs on the framing layer's reader task.
    fn incoming(&self, message: Option<Message>) {
        // A missing message signals remote close.
        let Some(message) = message else {
            self.remote_close();
            return;
        };

        if message.is_application() {
            self.recv_queue.push(message);
            self.available_callback.call(self.recv_queue.len());
            self.flush_pending_messages();
        }
        // Control frames were already acted on by the framing layer.
    }

    fn flush_pending_messages(&self) {
        if !self.message_callback.is_set() {
            return;
        }
        while let Some(message) = self.recv_queue.try_pop() {
            if message.is_application() {
                self.message_callback.call(message);
            }
        }
    }

    fn trigger_error(&self, reason: &str) {
        self.error_callback.call(reason.to_string());
    }

    fn init_tcp_transport(&self) -> Result<Arc<TcpTransport>, Error> {
        debug!("Starting TCP transport");
        let guard = self.init_mutex.lock().unwrap();
        if let Some(transport) = self.tcp.read().unwrap().clone() {
            return Ok(transport);
        }

        let Some(url) = self.url.read().unwrap().clone() else {
            return Err(Error::ConnectionClosed);
        };
        let secure = url.is_secure();

        let weak = self.weak_self.clone();
        let callback: StateCallback = Arc::new(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match state {
                TransportState::Connected => {
                    let result = if secure {
                        inner.init_tls_transport().map(|_| ())
                    } else {
                        inner.init_ws_transport().map(|_| ())
                    };
                    if let Err(e) = result {
                        debug!("Next layer initialization failed: {}", e);
                    }
                }
                TransportState::Failed => {
                    inner.trigger_error("TCP connection failed");
                    inner.remote_close();
                }
                TransportState::Disconnected => inner.remote_close(),
                _ => {}
            }
        });

        let transport = TcpTransport::new(
            url.hostname,
            url.service,
            self.config.connection_timeout,
            self.config.proxy_server.clone(),
            callback,
            self.handle.clone(),
        );
        *self.tcp.write().unwrap() = Some(transport.clone());

        // close() may have run between the state check and publication.
        if self.state() == State::Closed {
            self.dispose(self.tcp.write().unwrap().take(), None, None);
            return Err(Error::ConnectionClosed);
        }

        if let Err(e) = transport.clone().start() {
            *self.tcp.write().unwrap() = None;
            drop(guard);
            error!("{}", e);
            self.remote_close();
            return Err(Error::TransportInit("TCP"));
        }
        Ok(transport)
    }

    fn init_tls_transport(&self) -> Result<Arc<TlsTransport>, Error> {
        debug!("Starting TLS transport");
        let guard = self.init_mutex.lock().unwrap();
        if let Some(transport) = self.tls.read().unwrap().clone() {
            return Ok(transport);
        }

        let (lower, url) = match (
            self.tcp.read().unwrap().clone(),
            self.url.read().unwrap().clone(),
        ) {
            (Some(lower), Some(url)) => (lower, url),
            _ => {
                drop(guard);
                error!("TLS transport has no underlying TCP transport");
                self.remote_close();
                return Err(Error::TransportInit("TLS"));
            }
        };

        let connector = match self.config.build_tls_connector() {
            Ok(connector) => connector,
            Err(e) => {
                drop(guard);
                error!("{}", e);
                self.remote_close();
                return Err(Error::TransportInit("TLS"));
            }
        };

        let weak = self.weak_self.clone();
        let callback: StateCallback = Arc::new(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match state {
                TransportState::Connected => {
                    if let Err(e) = inner.init_ws_transport() {
                        debug!("Next layer initialization failed: {}", e);
                    }
                }
                TransportState::Failed => {
                    inner.trigger_error("TLS connection failed");
                    inner.remote_close();
                }
                TransportState::Disconnected => inner.remote_close(),
                _ => {}
            }
        });

        let transport = TlsTransport::new(
            lower,
            url.hostname,
            connector,
            callback,
            self.handle.clone(),
        );
        *self.tls.write().unwrap() = Some(transport.clone());

        if self.state() == State::Closed {
            self.dispose(None, self.tls.write().unwrap().take(), None);
            return Err(Error::ConnectionClosed);
        }

        if let Err(e) = transport.clone().start() {
            *self.tls.write().unwrap() = None;
            drop(guard);
            error!("{}", e);
            self.remote_close();
            return Err(Error::TransportInit("TLS"));
        }
        Ok(transport)
    }

    fn init_ws_transport(&self) -> Result<Arc<WsTransport>, Error> {
        debug!("Starting WebSocket transport");
        let guard = self.init_mutex.lock().unwrap();
        if let Some(transport) = self.ws.read().unwrap().clone() {
            return Ok(transport);
        }

        // The framing layer absorbs whichever byte stream topped out the
        // stack: TLS when present, plain TCP otherwise.
        let lower_stream = if let Some(tls) = self.tls.read().unwrap().clone() {
            tls.take_stream()
                .map(|stream| MaybeTlsStream::Tls(Box::new(stream)))
        } else if let Some(tcp) = self.tcp.read().unwrap().clone() {
            tcp.take_stream().map(MaybeTlsStream::Plain)
        } else {
            None
        };

        let (Some(lower_stream), Some(url)) = (lower_stream, self.url.read().unwrap().clone())
        else {
            drop(guard);
            error!("WebSocket transport has no established byte stream");
            self.remote_close();
            return Err(Error::TransportInit("WebSocket"));
        };

        let ws_config = WsConfig {
            host: url.host,
            path: url.path,
            protocols: self.config.protocols.clone(),
            max_message_size: self.config.max_message_size,
            ping_interval: self.config.ping_interval,
            max_outstanding_pings: self.config.max_outstanding_pings,
        };

        let weak = self.weak_self.clone();
        let message_callback: MessageCallback = Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.incoming(message);
            }
        });

        let weak = self.weak_self.clone();
        let state_callback: StateCallback = Arc::new(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match state {
                TransportState::Connected => {
                    // Suppressed if close() already moved the state on.
                    if inner.compare_state(State::Connecting, State::Open) {
                        debug!("WebSocket open");
                        inner.open_callback.call(());
                    }
                }
                TransportState::Failed => {
                    inner.trigger_error("WebSocket connection failed");
                    inner.remote_close();
                }
                TransportState::Disconnected => inner.remote_close(),
                _ => {}
            }
        });

        let transport = WsTransport::new(
            lower_stream,
            ws_config,
            message_callback,
            state_callback,
            self.handle.clone(),
        );
        *self.ws.write().unwrap() = Some(transport.clone());

        if self.state() == State::Closed {
            self.dispose(None, None, self.ws.write().unwrap().take());
            return Err(Error::ConnectionClosed);
        }

        if let Err(e) = transport.clone().start() {
            *self.ws.write().unwrap() = None;
            drop(guard);
            error!("{}", e);
            self.remote_close();
            return Err(Error::TransportInit("WebSocket"));
        }
        Ok(transport)
    }

    /// Tear the whole stack down. Fires `on_closed` exactly once per
    /// lifetime, silences the user callbacks, then stops the captured
    /// transports on a separate task: `stop` must never run on the task
    /// that delivered a transport's callback.
    fn close_transports(&self) {
        debug!("Closing transports");

        if self.state() != State::Closed && self.change_state(State::Closed) {
            self.closed_callback.call(());
        }

        // Reset callbacks now that state is changed.
        self.open_callback.reset();
        self.message_callback.reset();
        self.error_callback.reset();
        self.closed_callback.reset();
        self.available_callback.reset();

        self.dispose(
            self.tcp.write().unwrap().take(),
            self.tls.write().unwrap().take(),
            self.ws.write().unwrap().take(),
        );
    }

    /// Stop captured transports off-task, top of the stack first.
    fn dispose(
        &self,
        tcp: Option<Arc<TcpTransport>>,
        tls: Option<Arc<TlsTransport>>,
        ws: Option<Arc<WsTransport>>,
    ) {
        if tcp.is_none() && tls.is_none() && ws.is_none() {
            return;
        }
        self.handle.spawn(async move {
            if let Some(ws) = ws {
                ws.stop().await;
            }
            if let Some(tls) = tls {
                tls.stop().await;
            }
            if let Some(tcp) = tcp {
                tcp.stop().await;
            }
        });
    }
}
