//! TCP transport layer

use bytes::Bytes;
use peerlink_transport::{
    StateCallback, StateCell, Transport, TransportError, TransportResult, TransportState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use async_trait::async_trait;

/// Bottom layer of the stack: resolves the peer and establishes the TCP
/// stream, optionally tunnelling through an HTTP CONNECT proxy.
///
/// The established stream parks in this layer until the layer above takes
/// it with [`TcpTransport::take_stream`].
pub(crate) struct TcpTransport {
    hostname: String,
    service: String,
    timeout: Duration,
    proxy: Option<String>,
    state: StateCell,
    stream: Mutex<Option<TcpStream>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    handle: Handle,
}

impl TcpTransport {
    pub(crate) fn new(
        hostname: String,
        service: String,
        timeout: Duration,
        proxy: Option<String>,
        callback: StateCallback,
        handle: Handle,
    ) -> Arc<Self> {
        debug!("Initializing TCP transport");
        Arc::new(Self {
            hostname,
            service,
            timeout,
            proxy,
            state: StateCell::new(callback),
            stream: Mutex::new(None),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
            handle,
        })
    }

    /// Hand the established stream to the layer above.
    pub(crate) fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().unwrap().take()
    }

    /// `host:port` in a form the resolver accepts, re-bracketing IPv6.
    fn connect_address(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.service)
        } else {
            format!("{}:{}", self.hostname, self.service)
        }
    }

    async fn run(self: Arc<Self>) {
        self.state.change(TransportState::Connecting);

        let attempt = match &self.proxy {
            Some(proxy) => {
                tokio::time::timeout(self.timeout, self.connect_via_proxy(proxy)).await
            }
            None => tokio::time::timeout(self.timeout, self.connect_direct()).await,
        };

        match attempt {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                *self.stream.lock().unwrap() = Some(stream);
                if self.stopped.load(Ordering::SeqCst) {
                    self.stream.lock().unwrap().take();
                    return;
                }
                info!("Connected to {}:{}", self.hostname, self.service);
                self.state.change(TransportState::Connected);
            }
            Ok(Err(e)) => {
                warn!("TCP connect: {}", e);
                self.state.change(TransportState::Failed);
            }
            Err(_) => {
                warn!(
                    "TCP connection to {}:{} timed out",
                    self.hostname, self.service
                );
                self.state.change(TransportState::Failed);
            }
        }
    }

    async fn connect_direct(&self) -> TransportResult<TcpStream> {
        let address = self.connect_address();
        let addrs: Vec<_> = lookup_host(&address)
            .await
            .map_err(|e| {
                TransportError::ConnectionError(format!(
                    "Resolution failed for \"{}\": {}",
                    address, e
                ))
            })?
            .collect();

        let total = addrs.len();
        for (index, addr) in addrs.into_iter().enumerate() {
            debug!("Trying address {}", addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if index + 1 < total {
                        debug!("TCP connection to {} failed: {}", addr, e);
                    } else {
                        warn!("TCP connection to {} failed: {}", addr, e);
                    }
                }
            }
        }

        Err(TransportError::ConnectionError(format!(
            "Connection to {}:{} failed",
            self.hostname, self.service
        )))
    }

    async fn connect_via_proxy(&self, proxy: &str) -> TransportResult<TcpStream> {
        debug!("Connecting through proxy {}", proxy);
        let mut stream = TcpStream::connect(proxy).await.map_err(|e| {
            TransportError::ConnectionError(format!("Proxy connection to {} failed: {}", proxy, e))
        })?;

        let target = self.connect_address();
        let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
        stream.write_all(request.as_bytes()).await?;

        // The proxy sends nothing past its response header until we speak,
        // so reading up to the blank line cannot swallow payload bytes.
        let mut response = Vec::new();
        let mut buf = [0u8; 512];
        while !response.windows(4).any(|window| window == b"\r\n\r\n") {
            if response.len() > 8 * 1024 {
                return Err(TransportError::ProtocolError(
                    "Oversized proxy response".to_string(),
                ));
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(TransportError::ConnectionError(
                    "Proxy closed the connection".to_string(),
                ));
            }
            response.extend_from_slice(&buf[..n]);
        }

        let head = String::from_utf8_lossy(&response);
        let status_line = head.lines().next().unwrap_or_default();
        let accepted = status_line
            .split_whitespace()
            .nth(1)
            .map(|code| code.starts_with('2'))
            .unwrap_or(false);
        if !accepted {
            return Err(TransportError::ConnectionError(format!(
                "Proxy refused CONNECT to {}: {}",
                target, status_line
            )));
        }

        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn start(self: Arc<Self>) -> TransportResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "TCP transport already stopped".to_string(),
            ));
        }
        debug!("Starting TCP transport");
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
            debug!("Closing TCP stream");
        }
    }

    fn send(&self, data: Bytes) -> TransportResult<bool> {
        let guard = self.stream.lock().unwrap();
        let Some(stream) = guard.as_ref() else {
            return Ok(false);
        };

        let mut written = 0;
        while written < data.len() {
            match stream.try_write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("hostname", &self.hostname)
            .field("service", &self.service)
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn transport_to(
        hostname: &str,
        service: &str,
        callback: StateCallback,
    ) -> Arc<TcpTransport> {
        TcpTransport::new(
            hostname.to_string(),
            service.to_string(),
            Duration::from_secs(2),
            None,
            callback,
            Handle::current(),
        )
    }

    async fn expect_state(rx: &mut mpsc::UnboundedReceiver<TransportState>) -> TransportState {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no state change before timeout")
            .expect("state channel closed")
    }

    #[tokio::test]
    async fn connects_to_a_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = transport_to(
            "127.0.0.1",
            &port.to_string(),
            Arc::new(move |state| {
                let _ = tx.send(state);
            }),
        );
        transport.clone().start().unwrap();

        let (_peer, _) = listener.accept().await.unwrap();
        assert_eq!(expect_state(&mut rx).await, TransportState::Connecting);
        assert_eq!(expect_state(&mut rx).await, TransportState::Connected);

        assert!(transport.take_stream().is_some());
        transport.stop().await;
    }

    #[tokio::test]
    async fn reports_failure_for_unreachable_port() {
        // Bind-then-drop to get a port with no listener behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = transport_to(
            "127.0.0.1",
            &port.to_string(),
            Arc::new(move |state| {
                let _ = tx.send(state);
            }),
        );
        transport.clone().start().unwrap();

        assert_eq!(expect_state(&mut rx).await, TransportState::Connecting);
        assert_eq!(expect_state(&mut rx).await, TransportState::Failed);
        transport.stop().await;
    }

    #[tokio::test]
    async fn ipv6_connect_address_is_bracketed() {
        let transport = transport_to("::1", "9000", Arc::new(|_| {}));
        assert_eq!(transport.connect_address(), "[::1]:9000");
    }
}
