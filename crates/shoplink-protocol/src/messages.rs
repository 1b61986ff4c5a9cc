//! Typed storefront messages.
//!
//! The client core only deals in [`Envelope`]s. Application code converts
//! them into a [`StoreMessage`] at the boundary. Types this crate does not
//! know, and known types whose payload does not have the expected shape,
//! come through as [`StoreMessage::Unknown`] so newer servers never break
//! older dashboards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::envelope::Envelope;
use crate::message_types::MessageTypes;

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Stock levels of one product changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryUpdate {
    pub product_id: String,
    /// Online stock
    pub quantity: u32,
    /// In-store stock
    #[serde(default)]
    pub store_quantity: u32,
}

/// A product's catalog data changed. Carries only what dashboards display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_price: Option<f64>,
}

/// A new order was placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    pub total_amount: f64,
    #[serde(default)]
    pub status: OrderStatus,
}

/// An order moved through fulfilment or payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChange {
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Paid,
    Refunded,
}

// ─────────────────────────────────────────────────────────────────────────────
// StoreMessage
// ─────────────────────────────────────────────────────────────────────────────

/// A realtime message, keyed by its `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreMessage {
    ConnectionEstablished,
    InventoryUpdated(InventoryUpdate),
    ProductUpdated(ProductUpdate),
    OrderCreated(OrderCreated),
    OrderStatusChanged(OrderStatusChange),
    /// Anything else, kept verbatim.
    Unknown(Envelope),
}

impl StoreMessage {
    /// Interpret an envelope. Never fails; see [`StoreMessage::Unknown`].
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let typed = match envelope.kind.as_str() {
            MessageTypes::CONNECTION_ESTABLISHED => Some(Self::ConnectionEstablished),
            MessageTypes::INVENTORY_UPDATED => decode(envelope).map(Self::InventoryUpdated),
            MessageTypes::PRODUCT_UPDATED => decode(envelope).map(Self::ProductUpdated),
            MessageTypes::ORDER_CREATED => decode(envelope).map(Self::OrderCreated),
            MessageTypes::ORDER_STATUS_CHANGED => decode(envelope).map(Self::OrderStatusChanged),
            _ => None,
        };

        typed.unwrap_or_else(|| Self::Unknown(envelope.clone()))
    }

    /// The wire `type` of this message.
    pub fn kind(&self) -> &str {
        match self {
            Self::ConnectionEstablished => MessageTypes::CONNECTION_ESTABLISHED,
            Self::InventoryUpdated(_) => MessageTypes::INVENTORY_UPDATED,
            Self::ProductUpdated(_) => MessageTypes::PRODUCT_UPDATED,
            Self::OrderCreated(_) => MessageTypes::ORDER_CREATED,
            Self::OrderStatusChanged(_) => MessageTypes::ORDER_STATUS_CHANGED,
            Self::Unknown(envelope) => envelope.kind.as_str(),
        }
    }

    /// Build the envelope to put on the wire.
    pub fn to_envelope(&self) -> Envelope {
        let payload = match self {
            Self::ConnectionEstablished => Value::Null,
            Self::InventoryUpdated(p) => to_payload(p),
            Self::ProductUpdated(p) => to_payload(p),
            Self::OrderCreated(p) => to_payload(p),
            Self::OrderStatusChanged(p) => to_payload(p),
            Self::Unknown(envelope) => return envelope.clone(),
        };
        Envelope::new(self.kind(), payload)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl From<&Envelope> for StoreMessage {
    fn from(envelope: &Envelope) -> Self {
        Self::from_envelope(envelope)
    }
}

impl From<StoreMessage> for Envelope {
    fn from(message: StoreMessage) -> Self {
        match message {
            StoreMessage::Unknown(envelope) => envelope,
            other => other.to_envelope(),
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(envelope: &Envelope) -> Option<T> {
    match serde_json::from_value(envelope.payload.clone()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            debug!(kind = %envelope.kind, "Payload does not match known shape: {e}");
            None
        }
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}
