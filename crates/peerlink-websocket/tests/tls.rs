//! wss tests against a self-signed loopback server

use futures_util::{SinkExt, StreamExt};
use peerlink_websocket::{Message, WebSocket, WebSocketConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message as Frame;

#[derive(Debug, PartialEq)]
enum Event {
    Open,
    Message(Message),
    Error(String),
    Closed,
}

fn observed_endpoint(config: WebSocketConfig) -> (WebSocket, mpsc::UnboundedReceiver<Event>) {
    let ws = WebSocket::new(config).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    let events = tx.clone();
    ws.on_open(move || {
        let _ = events.send(Event::Open);
    });
    let events = tx.clone();
    ws.on_message(move |message| {
        let _ = events.send(Event::Message(message));
    });
    let events = tx.clone();
    ws.on_error(move |reason| {
        let _ = events.send(Event::Error(reason));
    });
    let events = tx;
    ws.on_closed(move || {
        let _ = events.send(Event::Closed);
    });

    (ws, rx)
}

async fn expect_event(rx: &mut mpsc::UnboundedReceiver<Event>, within: Duration) -> Event {
    timeout(within, rx.recv())
        .await
        .expect("no event before timeout")
        .expect("event channel closed")
}

struct SelfSigned {
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
    cert_pem: String,
}

fn self_signed_identity() -> SelfSigned {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    SelfSigned {
        cert_der: certified.cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        )),
        cert_pem: certified.cert.pem(),
    }
}

/// wss echo server over the given identity.
async fn spawn_tls_echo_server(identity: &SelfSigned) -> u16 {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![identity.cert_der.clone()], identity.key_der.clone_key())
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls_stream) = acceptor.accept(stream).await else {
                    return;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(tls_stream).await else {
                    return;
                };
                while let Some(Ok(frame)) = ws.next().await {
                    match frame {
                        Frame::Text(_) | Frame::Binary(_) => {
                            if ws.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Frame::Close(_) => {
                            let _ = ws.close(None).await;
                            break;
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    port
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn insecure_endpoint_opens_against_self_signed_server() {
    let identity = self_signed_identity();
    let port = spawn_tls_echo_server(&identity).await;

    let (ws, mut events) = observed_endpoint(WebSocketConfig::insecure());
    ws.open(&format!("wss://localhost:{port}/")).unwrap();

    assert_eq!(expect_event(&mut events, Duration::from_secs(2)).await, Event::Open);

    assert!(ws.send_text("over tls").unwrap());
    assert_eq!(
        expect_event(&mut events, Duration::from_secs(1)).await,
        Event::Message(Message::Text("over tls".to_string()))
    );

    ws.close();
    assert_eq!(
        expect_event(&mut events, Duration::from_secs(2)).await,
        Event::Closed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verification_rejects_self_signed_server() {
    let identity = self_signed_identity();
    let port = spawn_tls_echo_server(&identity).await;

    let (ws, mut events) = observed_endpoint(WebSocketConfig::default());
    ws.open(&format!("wss://localhost:{port}/")).unwrap();

    match expect_event(&mut events, Duration::from_secs(5)).await {
        Event::Error(reason) => assert!(reason.contains("TLS connection failed")),
        other => panic!("expected an error event, got {:?}", other),
    }
    assert_eq!(
        expect_event(&mut events, Duration::from_secs(2)).await,
        Event::Closed
    );
    assert!(ws.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_ca_bundle_trusts_the_server() {
    let identity = self_signed_identity();
    let port = spawn_tls_echo_server(&identity).await;

    // Verification stays on; trust comes from the configured CA file.
    let mut ca_file = tempfile();
    ca_file.write_all(identity.cert_pem.as_bytes()).unwrap();
    ca_file.flush().unwrap();

    let config = WebSocketConfig::default().with_ca_certificate(ca_file.path.clone());
    let (ws, mut events) = observed_endpoint(config);
    ws.open(&format!("wss://localhost:{port}/")).unwrap();

    assert_eq!(expect_event(&mut events, Duration::from_secs(2)).await, Event::Open);
    ws.close();
    assert_eq!(
        expect_event(&mut events, Duration::from_secs(2)).await,
        Event::Closed
    );
}

/// Minimal self-deleting temp file; keeps the dev-dependency list short.
struct TempPath {
    path: std::path::PathBuf,
    file: std::fs::File,
}

impl Write for TempPath {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn tempfile() -> TempPath {
    let path = std::env::temp_dir().join(format!(
        "peerlink-test-ca-{}-{:?}.pem",
        std::process::id(),
        std::thread::current().id()
    ));
    let file = std::fs::File::create(&path).unwrap();
    TempPath { path, file }
}
