//! Transport construction.
//!
//! The client never talks to a socket library directly. It asks a
//! [`Connector`] for a [`Transport`]: a sink of outbound text frames and a
//! stream of inbound ones. The stream ending means the peer closed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Once;

use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("transport closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One live duplex connection, carrying UTF-8 text frames.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens transports. Implemented by [`WsConnector`] for real sockets.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Transport, TransportError>> + Send;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

/// `wss` handshakes need a process-wide rustls provider; install ring unless
/// the host application already chose one.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError> {
        install_crypto_provider();
        let (ws, response) = connect_async(url).await?;
        debug!(url, status = %response.status(), "WebSocket handshake complete");

        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx.with(|text: String| {
            future::ready(Ok::<_, TransportError>(Message::Text(text.into())))
        });

        // Control frames are answered by tungstenite itself; binary frames are
        // not part of the wire format.
        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => {
                    debug!(len = data.len(), "Ignoring binary frame");
                    None
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Peer sent close frame");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Transport::new(sink, stream))
    }
}
