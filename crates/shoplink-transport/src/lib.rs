//! Shoplink Transport Layer
//!
//! Keeps a storefront dashboard connected to its realtime channel.
//! The transport layer handles:
//! - Endpoint derivation from the page origin
//! - Connection lifecycle (connect, open, message, close) with fixed-delay reconnects
//! - Handler dispatch for inbound messages
//! - A development relay hub that speaks the same wire format
//!
//! The client is decoupled from the socket library via the `Connector` trait.

pub mod client;
pub mod connector;
pub mod endpoint;
pub mod hub;
pub mod subscribers;

pub use client::{
    ClientConfig, ClientEvent, ConnectionState, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_DELAY,
    RealtimeClient,
};
pub use connector::{Connector, Transport, TransportError, WsConnector};
pub use endpoint::{EndpointConfig, EndpointError, Environment, Origin, endpoint_url};
pub use hub::{DevHub, HubConfig, HubError};
pub use subscribers::SubscriptionId;
