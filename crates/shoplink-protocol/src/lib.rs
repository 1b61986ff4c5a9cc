//! Shoplink realtime protocol types.
//!
//! Every frame on the storefront realtime channel is a JSON text frame
//! holding an [`Envelope`]: `{ "type": "...", "payload": ... }`.
//! This crate is the single source of truth for the envelope codec,
//! the known message type names, and their typed payloads.

pub mod envelope;
pub mod error;
pub mod message_types;
pub mod messages;

pub use envelope::Envelope;
pub use error::ProtocolError;
pub use message_types::{MessageType, MessageTypes, is_known_type};
pub use messages::{
    InventoryUpdate, OrderCreated, OrderStatus, OrderStatusChange, PaymentStatus,
    ProductUpdate, StoreMessage,
};
