//! Tests for the transport contract

use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Mock transport for testing the layer contract
#[derive(Debug)]
pub struct MockTransport {
    state: StateCell,
    stopped: AtomicBool,
    stop_count: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    /// When true, `send` refuses admission like a mid-stack layer whose
    /// stream has been absorbed by the layer above.
    absorbed: AtomicBool,
}

impl MockTransport {
    pub fn new(callback: StateCallback) -> Arc<Self> {
        Arc::new(Self {
            state: StateCell::new(callback),
            stopped: AtomicBool::new(false),
            stop_count: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            absorbed: AtomicBool::new(false),
        })
    }

    pub fn absorb(&self) {
        self.absorbed.store(true, Ordering::SeqCst);
    }

    pub fn connect(&self) {
        self.state.change(TransportState::Connected);
    }

    pub fn fail(&self) {
        self.state.change(TransportState::Failed);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn start(self: Arc<Self>) -> TransportResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "transport already stopped".to_string(),
            ));
        }
        self.state.change(TransportState::Connecting);
        Ok(())
    }

    async fn stop(self: Arc<Self>) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn send(&self, data: Bytes) -> TransportResult<bool> {
        if self.absorbed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.state.get() != TransportState::Connected {
            return Ok(false);
        }
        self.sent.lock().unwrap().push(data);
        Ok(true)
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}

mod contract {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> StateCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn start_reports_connecting() {
        let transport = MockTransport::new(noop());
        transport.clone().start().unwrap();
        assert_eq!(transport.state(), TransportState::Connecting);
    }

    #[tokio::test]
    async fn state_edges_reach_the_callback_in_order() {
        let edges = Arc::new(Mutex::new(Vec::new()));
        let sink = edges.clone();
        let transport = MockTransport::new(Arc::new(move |state| {
            sink.lock().unwrap().push(state);
        }));

        transport.clone().start().unwrap();
        transport.connect();

        assert_eq!(
            *edges.lock().unwrap(),
            vec![TransportState::Connecting, TransportState::Connected]
        );
    }

    #[tokio::test]
    async fn send_is_admitted_only_when_connected() {
        let transport = MockTransport::new(noop());
        assert!(!transport.send(Bytes::from_static(b"early")).unwrap());

        transport.clone().start().unwrap();
        transport.connect();
        assert!(transport.send(Bytes::from_static(b"data")).unwrap());
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn absorbed_layer_refuses_direct_sends() {
        let transport = MockTransport::new(noop());
        transport.clone().start().unwrap();
        transport.connect();
        transport.absorb();

        assert!(!transport.send(Bytes::from_static(b"data")).unwrap());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let transport = MockTransport::new(noop());
        transport.clone().start().unwrap();

        transport.clone().stop().await;
        transport.clone().stop().await;
        assert_eq!(transport.stop_count(), 1);

        // A stopped transport refuses to start again.
        assert!(transport.clone().start().is_err());
    }

    #[tokio::test]
    async fn failure_is_a_single_edge() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let transport = MockTransport::new(Arc::new(move |state| {
            if state == TransportState::Failed {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        transport.clone().start().unwrap();
        transport.fail();
        transport.fail();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
