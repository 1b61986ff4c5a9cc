//! Reconnecting realtime channel client.
//!
//! A [`RealtimeClient`] keeps one best-effort duplex connection open to the
//! storefront's realtime endpoint. Connection state lives in a `watch` cell
//! shared with a single driver task; the driver owns the transport and the
//! reconnect deadline and invokes every handler, so handlers always run
//! one at a time.
//!
//! State machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --transport opens--> Open
//! Connecting --transport errors/closes/times out--> Disconnected (retry after delay)
//! Open --transport errors/closes--> Disconnected (retry after delay)
//! any --close()--> Closing (terminal)
//! ```
//!
//! Retries use a fixed delay and never give up. Network errors and clean
//! server-side closes are treated the same.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use shoplink_protocol::{Envelope, MessageTypes};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::connector::{Connector, Transport, WsConnector};
use crate::endpoint::{EndpointConfig, EndpointError};
use crate::subscribers::{Filter, SubscriberRegistry, SubscriptionId};

/// Default delay between an unexpected disconnect and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default limit on opening a transport, handshake included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where to connect
    pub endpoint: EndpointConfig,
    /// Fixed delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// A dial still pending after this long counts as a failed attempt
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Terminal. Entered through `close()` or drop.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Lifecycle notification, delivered once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A transport is being opened.
    Connecting,
    /// The transport is open; `send` now succeeds.
    Open,
    /// The transport failed or was closed by the peer. Another attempt
    /// starts after `retry_in`.
    Disconnected { retry_in: Duration },
    /// `close()` completed; nothing further will happen.
    Closed,
}

enum Command {
    Dial,
    Close,
}

/// State shared between the client handle and its driver.
struct Shared {
    url: String,
    state: watch::Sender<ConnectionState>,
    /// Frames for the live transport. Only `Some` while Open.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    subscribers: RwLock<SubscriberRegistry>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Disconnected → Connecting. Returns whether the transition happened.
    fn begin_connect(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        })
    }

    /// Move to `next` unless already there or Closing.
    fn set_state(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closing || *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn emit(&self, event: ClientEvent) {
        let handlers = self.subscribers.read().lifecycle_handlers();
        for handler in handlers {
            handler(&event);
        }
    }

    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error_kind = e.kind(), "Dropping malformed realtime frame: {e}");
                return;
            }
        };

        if envelope.is(MessageTypes::CONNECTION_ESTABLISHED) {
            info!(url = %self.url, "Realtime channel established by server");
        } else {
            debug!(kind = %envelope.kind, "Realtime message received");
        }

        let handlers = self.subscribers.read().message_handlers(&envelope.kind);
        for handler in handlers {
            handler(&envelope);
        }
    }
}

/// A reconnecting realtime channel client.
///
/// Must be created inside a tokio runtime. Dropping the client has the same
/// effect as [`close`](Self::close).
pub struct RealtimeClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Create a client that connects over WebSocket. Does not connect yet.
    pub fn new(config: ClientConfig) -> Result<Self, EndpointError> {
        Self::with_connector(config, WsConnector)
    }

    /// Create a client with a custom transport connector.
    pub fn with_connector<C: Connector>(
        config: ClientConfig,
        connector: C,
    ) -> Result<Self, EndpointError> {
        let url = config.endpoint.url()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            url,
            state,
            outbound: Mutex::new(None),
            subscribers: RwLock::new(SubscriberRegistry::new()),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            shared: shared.clone(),
            connector,
            commands: command_rx,
            reconnect_delay: config.reconnect_delay,
            connect_timeout: config.connect_timeout,
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            shared,
            commands,
            task: Mutex::new(Some(task)),
        })
    }

    /// The URL this client dials.
    pub fn endpoint(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Observe every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Start connecting. Only acts when Disconnected; otherwise a no-op.
    pub fn connect(&self) {
        if self.shared.begin_connect() {
            let _ = self.commands.send(Command::Dial);
        } else {
            debug!(state = %self.state(), "connect() ignored");
        }
    }

    /// Serialize `message` and write it to the live transport.
    ///
    /// Returns `false`, without queueing anything, when the channel is not
    /// open or the message cannot be serialized.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize outbound message: {e}");
                return false;
            }
        };

        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if self.shared.state() == ConnectionState::Open => tx.send(text).is_ok(),
            _ => {
                debug!(state = %self.state(), "Realtime channel not open, message not sent");
                false
            }
        }
    }

    /// Register a handler for every inbound message.
    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.shared.subscribers.write().add_message(Filter::All, Arc::new(handler))
    }

    /// Register a handler for inbound messages of one `type`.
    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.shared
            .subscribers
            .write()
            .add_message(Filter::Type(kind.into()), Arc::new(handler))
    }

    /// Register a lifecycle handler.
    pub fn on_lifecycle<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.write().add_lifecycle(Arc::new(handler))
    }

    /// Remove a message or lifecycle handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.subscribers.write().remove(id)
    }

    /// Close the channel for good: drops any pending reconnect, closes the
    /// transport, and stops all further attempts.
    pub fn close(&self) {
        let previous = self.shared.state.send_replace(ConnectionState::Closing);
        if previous == ConnectionState::Closing {
            return;
        }
        self.shared.outbound.lock().take();
        let _ = self.commands.send(Command::Close);
        debug!(url = %self.shared.url, "Realtime channel closing");
    }

    /// Wait for the driver task to finish after [`close`](Self::close).
    pub async fn closed(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

enum Exit {
    /// Unexpected error or peer close.
    Lost,
    /// `close()` was called.
    Closed,
}

struct Driver<C> {
    shared: Arc<Shared>,
    connector: C,
    commands: mpsc::UnboundedReceiver<Command>,
    reconnect_delay: Duration,
    connect_timeout: Duration,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        let mut retry_at: Option<Instant> = None;

        loop {
            let reconnect = async move {
                match retry_at {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let dial = tokio::select! {
                cmd = self.commands.recv() => matches!(cmd, Some(Command::Dial)),
                _ = reconnect => {
                    retry_at = None;
                    if !self.shared.begin_connect() {
                        // A manual connect() or close() got there first; its
                        // command is already queued.
                        continue;
                    }
                    debug!("Reconnect timer fired");
                    true
                }
            };

            if !dial {
                break;
            }
            retry_at = None;
            if self.shared.state() != ConnectionState::Connecting {
                continue;
            }

            self.shared.emit(ClientEvent::Connecting);

            match self.dial_and_serve().await {
                Exit::Closed => break,
                Exit::Lost => {
                    if !self.shared.set_state(ConnectionState::Disconnected) {
                        break;
                    }
                    let delay = self.reconnect_delay;
                    info!(
                        url = %self.shared.url,
                        "Realtime channel disconnected, will try to reconnect in {delay:?}"
                    );
                    retry_at = Some(Instant::now() + delay);
                    self.shared.emit(ClientEvent::Disconnected { retry_in: delay });
                }
            }
        }

        self.shared.outbound.lock().take();
        // close() has usually stored Closing already.
        self.shared.set_state(ConnectionState::Closing);
        self.shared.emit(ClientEvent::Closed);
        info!(url = %self.shared.url, "Realtime channel closed");
    }

    async fn dial_and_serve(&mut self) -> Exit {
        let url = self.shared.url.clone();
        debug!(url = %url, "Opening realtime transport");

        let result = {
            let connecting = timeout(self.connect_timeout, self.connector.connect(&url));
            tokio::pin!(connecting);

            loop {
                tokio::select! {
                    result = &mut connecting => break result,
                    cmd = self.commands.recv() => match cmd {
                        Some(Command::Dial) => continue,
                        Some(Command::Close) | None => return Exit::Closed,
                    },
                }
            }
        };

        let mut transport = match result {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!(url = %url, "Realtime connection failed: {e}");
                return Exit::Lost;
            }
            Err(_) => {
                let limit = self.connect_timeout;
                warn!(url = %url, "Realtime connection timed out after {limit:?}");
                return Exit::Lost;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.shared.outbound.lock() = Some(outbound_tx);

        if !self.shared.set_state(ConnectionState::Open) {
            self.shared.outbound.lock().take();
            let _ = transport.sink.close().await;
            return Exit::Closed;
        }

        info!(url = %url, "Realtime channel connected");
        self.shared.emit(ClientEvent::Open);

        let exit = self.serve(&mut transport, outbound_rx).await;
        self.shared.outbound.lock().take();
        exit
    }

    async fn serve(
        &mut self,
        transport: &mut Transport,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) -> Exit {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Dial) => {}
                    Some(Command::Close) | None => {
                        if let Err(e) = transport.sink.close().await {
                            debug!("Error while closing realtime transport: {e}");
                        }
                        return Exit::Closed;
                    }
                },

                Some(text) = outbound.recv() => {
                    if let Err(e) = transport.sink.send(text).await {
                        warn!("Failed to write realtime frame: {e}");
                        return Exit::Lost;
                    }
                }

                frame = transport.stream.next() => match frame {
                    Some(Ok(text)) => self.shared.dispatch(&text),
                    Some(Err(e)) => {
                        warn!("Realtime transport error: {e}");
                        return Exit::Lost;
                    }
                    None => {
                        debug!("Realtime transport closed by peer");
                        return Exit::Lost;
                    }
                },
            }
        }
    }
}
