//! Client state machine tests against an in-memory connector.
//!
//! Time is paused, so reconnect delays are exact and cost nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{sink, stream};
use parking_lot::Mutex;
use serde_json::json;
use shoplink_protocol::{Envelope, MessageTypes};
use shoplink_transport::{
    ClientConfig, ClientEvent, ConnectionState, Connector, EndpointConfig, Environment,
    RealtimeClient, Transport, TransportError,
};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, sleep, timeout};

const DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// In-memory connector
// ─────────────────────────────────────────────────────────────────────────────

/// Test-side end of one transport.
struct Peer {
    url: String,
    /// Frames written by the client
    from_client: mpsc::UnboundedReceiver<String>,
    /// Frames delivered to the client; dropping this closes the transport
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl Peer {
    fn push(&self, text: &str) {
        self.to_client.send(Ok(text.to_string())).unwrap();
    }

    fn fail(&self) {
        self.to_client
            .send(Err(TransportError::Other("connection reset".into())))
            .unwrap();
    }
}

/// Decrements the live-transport count once both halves are gone.
struct Live(Arc<AtomicUsize>);

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockInner {
    dials: Mutex<Vec<(String, Instant)>>,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
    failures: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    peers: mpsc::UnboundedSender<Peer>,
}

#[derive(Clone)]
struct MockConnector {
    inner: Arc<MockInner>,
}

impl MockConnector {
    fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        Self::build(None)
    }

    /// Dials block until a permit is added to the returned semaphore.
    fn gated() -> (Self, mpsc::UnboundedReceiver<Peer>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let (connector, peers) = Self::build(Some(gate.clone()));
        (connector, peers, gate)
    }

    fn build(gate: Option<Arc<Semaphore>>) -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let inner = MockInner {
            dials: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            gate,
            peers,
        };
        (Self { inner: Arc::new(inner) }, peer_rx)
    }

    fn fail_next(&self, n: usize) {
        self.inner.failures.store(n, Ordering::SeqCst);
    }

    fn dial_count(&self) -> usize {
        self.inner.dials.lock().len()
    }

    fn dial_times(&self) -> Vec<Instant> {
        self.inner.dials.lock().iter().map(|(_, at)| *at).collect()
    }

    fn max_live(&self) -> usize {
        self.inner.max_live.load(Ordering::SeqCst)
    }

    fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError> {
        self.inner.dials.lock().push((url.to_string(), Instant::now()));

        if let Some(gate) = &self.inner.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let failures = self.inner.failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.inner.failures.store(failures - 1, Ordering::SeqCst);
            return Err(TransportError::Other("connection refused".into()));
        }

        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_live.fetch_max(live, Ordering::SeqCst);
        let guard = Arc::new(Live(self.inner.live.clone()));

        let (client_tx, from_client) = mpsc::unbounded_channel::<String>();
        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<String, TransportError>>();

        let sink = sink::unfold((client_tx, guard.clone()), |(tx, guard), frame: String| async move {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>((tx, guard))
        });
        let stream = stream::unfold((client_rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        });

        let _ = self.inner.peers.send(Peer {
            url: url.to_string(),
            from_client,
            to_client,
        });
        Ok(Transport::new(sink, stream))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn config() -> ClientConfig {
    ClientConfig {
        endpoint: EndpointConfig {
            origin: "https://shop.example.com".into(),
            environment: Environment::Production,
            ..Default::default()
        },
        reconnect_delay: DELAY,
        connect_timeout: CONNECT_TIMEOUT,
    }
}

async fn wait_state(client: &RealtimeClient, state: ConnectionState) {
    let mut rx = client.state_changes();
    timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("client state dropped");
}

async fn next_peer(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    timeout(WAIT, peers.recv())
        .await
        .expect("timed out waiting for a dial")
        .expect("connector dropped")
}

fn record_events(client: &RealtimeClient) -> Arc<Mutex<Vec<ClientEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    client.on_lifecycle(move |event| sink.lock().push(*event));
    events
}

fn collect_messages(client: &RealtimeClient) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_message(move |envelope| {
        let _ = tx.send(envelope.clone());
    });
    rx
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("handler dropped")
}

async fn open_client() -> (RealtimeClient, MockConnector, mpsc::UnboundedReceiver<Peer>, Peer) {
    let (connector, mut peers) = MockConnector::new();
    let client = RealtimeClient::with_connector(config(), connector.clone()).unwrap();
    client.connect();
    let peer = next_peer(&mut peers).await;
    wait_state(&client, ConnectionState::Open).await;
    (client, connector, peers, peer)
}

// ─────────────────────────────────────────────────────────────────────────────
// Connecting
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn dials_the_secure_endpoint_for_a_secure_origin() {
    let (client, _connector, _peers, peer) = open_client().await;
    assert_eq!(client.endpoint(), "wss://shop.example.com/ws");
    assert_eq!(peer.url, "wss://shop.example.com/ws");
}

#[tokio::test(start_paused = true)]
async fn starts_disconnected_and_does_not_dial_until_asked() {
    let (connector, _peers) = MockConnector::new();
    let client = RealtimeClient::with_connector(config(), connector.clone()).unwrap();
    sleep(WAIT).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(connector.dial_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent() {
    let (connector, mut peers, gate) = MockConnector::gated();
    let client = RealtimeClient::with_connector(config(), connector.clone()).unwrap();

    client.connect();
    client.connect();
    client.connect();
    assert_eq!(client.state(), ConnectionState::Connecting);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.dial_count(), 1);

    gate.add_permits(1);
    let _peer = next_peer(&mut peers).await;
    wait_state(&client, ConnectionState::Open).await;

    client.connect();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.dial_count(), 1);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn bad_origin_is_rejected_at_construction() {
    let (connector, _peers) = MockConnector::new();
    let config = ClientConfig {
        endpoint: EndpointConfig {
            origin: "shop.example.com".into(),
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(RealtimeClient::with_connector(config, connector).is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Sending
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn send_fails_until_open() {
    let (connector, mut peers, gate) = MockConnector::gated();
    let client = RealtimeClient::with_connector(config(), connector).unwrap();
    let msg = Envelope::bare("ping");

    assert!(!client.send(&msg), "send while disconnected");

    client.connect();
    assert!(!client.send(&msg), "send while connecting");

    gate.add_permits(1);
    let mut peer = next_peer(&mut peers).await;
    wait_state(&client, ConnectionState::Open).await;

    assert!(client.send(&msg));
    let frame = timeout(WAIT, peer.from_client.recv()).await.unwrap().unwrap();
    assert_eq!(frame, r#"{"type":"ping"}"#);
    assert!(peer.from_client.try_recv().is_err(), "exactly one frame");
}

#[tokio::test(start_paused = true)]
async fn send_serializes_any_message() {
    let (client, _connector, _peers, mut peer) = open_client().await;

    assert!(client.send(&json!({"type": "cart_viewed", "payload": {"items": 2}})));
    let frame = timeout(WAIT, peer.from_client.recv()).await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["payload"]["items"], 2);
}

#[tokio::test(start_paused = true)]
async fn send_fails_after_disconnect() {
    let (client, _connector, _peers, peer) = open_client().await;
    drop(peer);
    wait_state(&client, ConnectionState::Disconnected).await;
    assert!(!client.send(&Envelope::bare("ping")));
}

// ─────────────────────────────────────────────────────────────────────────────
// Receiving
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn inbound_messages_reach_wildcard_and_typed_handlers() {
    let (client, _connector, _peers, peer) = open_client().await;
    let mut all = collect_messages(&client);

    let (stock_tx, mut stock) = mpsc::unbounded_channel();
    client.subscribe(MessageTypes::INVENTORY_UPDATED, move |envelope| {
        let _ = stock_tx.send(envelope.clone());
    });

    peer.push(r#"{"type":"connection_established"}"#);
    peer.push(r#"{"type":"inventory_updated","payload":{"productId":"p1","quantity":3}}"#);

    assert_eq!(next_message(&mut all).await.kind, "connection_established");
    let update = next_message(&mut all).await;
    assert_eq!(update.payload["quantity"], 3);

    let typed = next_message(&mut stock).await;
    assert_eq!(typed, update);
    assert!(stock.try_recv().is_err(), "typed handler only sees its type");
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_touching_state() {
    let (client, _connector, _peers, peer) = open_client().await;
    let events = record_events(&client);
    let mut messages = collect_messages(&client);

    peer.push("not valid json at all {{{");
    peer.push("[1,2,3]");
    peer.push(r#"{"payload":{"quantity":1}}"#);
    peer.push(r#"{"type":"order_created","payload":{"orderId":"o-1","totalAmount":10}}"#);

    let first = next_message(&mut messages).await;
    assert_eq!(first.kind, "order_created");
    assert!(messages.try_recv().is_err());
    assert_eq!(client.state(), ConnectionState::Open);
    assert!(events.lock().is_empty(), "no lifecycle transitions");
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_handlers_stop_receiving() {
    let (client, _connector, _peers, peer) = open_client().await;
    let mut kept = collect_messages(&client);

    let dropped_count = Arc::new(AtomicUsize::new(0));
    let counter = dropped_count.clone();
    let id = client.on_message(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    peer.push(r#"{"type":"a"}"#);
    next_message(&mut kept).await;
    assert_eq!(dropped_count.load(Ordering::SeqCst), 1);

    assert!(client.unsubscribe(id));
    assert!(!client.unsubscribe(id));

    peer.push(r#"{"type":"b"}"#);
    next_message(&mut kept).await;
    assert_eq!(dropped_count.load(Ordering::SeqCst), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconnecting
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unexpected_close_schedules_exactly_one_reconnect() {
    let (client, connector, mut peers, peer) = open_client().await;
    let events = record_events(&client);

    drop(peer);
    wait_state(&client, ConnectionState::Disconnected).await;
    let disconnected_at = Instant::now();

    let _peer = next_peer(&mut peers).await;
    wait_state(&client, ConnectionState::Open).await;

    let dials = connector.dial_times();
    assert_eq!(dials.len(), 2);
    let waited = dials[1] - disconnected_at;
    assert!(waited >= DELAY && waited < DELAY + Duration::from_secs(1), "waited {waited:?}");

    sleep(WAIT).await;
    assert_eq!(connector.dial_count(), 2, "no extra attempts once open");
    assert_eq!(connector.max_live(), 1);

    assert_eq!(
        *events.lock(),
        vec![
            ClientEvent::Disconnected { retry_in: DELAY },
            ClientEvent::Connecting,
            ClientEvent::Open,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn transport_error_uses_the_same_retry_policy() {
    let (client, connector, mut peers, peer) = open_client().await;

    peer.fail();
    wait_state(&client, ConnectionState::Disconnected).await;
    let disconnected_at = Instant::now();

    let _peer = next_peer(&mut peers).await;
    let waited = connector.dial_times()[1] - disconnected_at;
    assert!(waited >= DELAY && waited < DELAY + Duration::from_secs(1), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn failed_dials_retry_forever_at_a_fixed_delay() {
    let (connector, mut peers) = MockConnector::new();
    connector.fail_next(3);
    let client = RealtimeClient::with_connector(config(), connector.clone()).unwrap();
    let events = record_events(&client);

    client.connect();
    let _peer = next_peer(&mut peers).await;
    wait_state(&client, ConnectionState::Open).await;

    let dials = connector.dial_times();
    assert_eq!(dials.len(), 4);
    for pair in dials.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= DELAY && gap < DELAY + Duration::from_secs(1), "gap {gap:?}");
    }

    let events = events.lock();
    let disconnects = events
        .iter()
        .filter(|e| matches!(e, ClientEvent::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 3);
    assert_eq!(events.last(), Some(&ClientEvent::Open));
}

#[tokio::test(start_paused = true)]
async fn stalled_dial_times_out_and_is_retried() {
    // The gate is never opened, so every handshake hangs.
    let (connector, _peers, _gate) = MockConnector::gated();
    let client = RealtimeClient::with_connector(config(), connector.clone()).unwrap();
    let events = record_events(&client);

    client.connect();
    wait_state(&client, ConnectionState::Disconnected).await;
    let gave_up = Instant::now() - connector.dial_times()[0];
    assert!(
        gave_up >= CONNECT_TIMEOUT && gave_up < CONNECT_TIMEOUT + Duration::from_secs(1),
        "gave up after {gave_up:?}"
    );
    assert_eq!(connector.live(), 0);

    sleep(DELAY + Duration::from_millis(100)).await;
    assert_eq!(connector.dial_count(), 2);
    assert_eq!(client.state(), ConnectionState::Connecting);
    assert_eq!(
        *events.lock(),
        vec![
            ClientEvent::Connecting,
            ClientEvent::Disconnected { retry_in: DELAY },
            ClientEvent::Connecting,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn manual_connect_during_backoff_replaces_the_timer() {
    let (client, connector, mut peers, peer) = open_client().await;

    drop(peer);
    wait_state(&client, ConnectionState::Disconnected).await;
    let disconnected_at = Instant::now();

    client.connect();
    let _peer = next_peer(&mut peers).await;
    wait_state(&client, ConnectionState::Open).await;
    assert!(connector.dial_times()[1] - disconnected_at < DELAY);

    sleep(WAIT).await;
    assert_eq!(connector.dial_count(), 2, "the old timer must not dial again");
}

#[tokio::test(start_paused = true)]
async fn only_one_transport_is_ever_live() {
    let (client, connector, mut peers, mut peer) = open_client().await;

    for _ in 0..5 {
        drop(peer);
        wait_state(&client, ConnectionState::Disconnected).await;
        peer = next_peer(&mut peers).await;
        wait_state(&client, ConnectionState::Open).await;
        assert_eq!(connector.live(), 1);
    }

    assert_eq!(connector.dial_count(), 6);
    assert_eq!(connector.max_live(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Closing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn close_while_open_closes_transport_and_never_reconnects() {
    let (client, connector, _peers, mut peer) = open_client().await;
    let events = record_events(&client);

    client.close();
    client.closed().await;

    assert_eq!(timeout(WAIT, peer.from_client.recv()).await.unwrap(), None);
    assert_eq!(client.state(), ConnectionState::Closing);
    assert_eq!(connector.live(), 0);

    sleep(WAIT).await;
    assert_eq!(connector.dial_count(), 1);
    assert_eq!(*events.lock(), vec![ClientEvent::Closed]);

    client.connect();
    assert!(!client.send(&Envelope::bare("ping")));
    assert_eq!(client.state(), ConnectionState::Closing);
}

#[tokio::test(start_paused = true)]
async fn close_publishes_a_single_state_change() {
    let (client, _connector, _peers, _peer) = open_client().await;
    let mut states = client.state_changes();
    states.borrow_and_update();

    client.close();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Closing);

    client.closed().await;
    assert!(!states.has_changed().unwrap(), "driver re-published Closing");
}

#[tokio::test(start_paused = true)]
async fn close_during_backoff_disarms_the_timer() {
    let (client, connector, _peers, peer) = open_client().await;

    drop(peer);
    wait_state(&client, ConnectionState::Disconnected).await;

    client.close();
    client.closed().await;

    sleep(WAIT).await;
    assert_eq!(connector.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_while_connecting_abandons_the_dial() {
    let (connector, _peers, gate) = MockConnector::gated();
    let client = RealtimeClient::with_connector(config(), connector.clone()).unwrap();

    client.connect();
    sleep(Duration::from_millis(100)).await;
    client.close();
    client.closed().await;

    gate.add_permits(10);
    sleep(WAIT).await;
    assert_eq!(connector.dial_count(), 1);
    assert_eq!(connector.live(), 0);
    assert_eq!(client.state(), ConnectionState::Closing);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_client_closes_the_transport() {
    let (client, connector, _peers, mut peer) = open_client().await;

    drop(client);

    assert_eq!(timeout(WAIT, peer.from_client.recv()).await.unwrap(), None);
    sleep(WAIT).await;
    assert_eq!(connector.dial_count(), 1);
}
