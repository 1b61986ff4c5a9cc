//! Realtime message type names.
//!
//! The server pushes these to dashboards; applications subscribe to the
//! ones they care about.

/// All known message type names.
pub struct MessageTypes;

impl MessageTypes {
    // ── Connection ──────────────────────────────────────────────────────
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";

    // ── Inventory ───────────────────────────────────────────────────────
    pub const INVENTORY_UPDATED: &str = "inventory_updated";
    pub const PRODUCT_UPDATED: &str = "product_updated";

    // ── Orders ──────────────────────────────────────────────────────────
    pub const ORDER_CREATED: &str = "order_created";
    pub const ORDER_STATUS_CHANGED: &str = "order_status_changed";

    pub const ALL: &[&str] = &[
        Self::CONNECTION_ESTABLISHED,
        Self::INVENTORY_UPDATED,
        Self::PRODUCT_UPDATED,
        Self::ORDER_CREATED,
        Self::ORDER_STATUS_CHANGED,
    ];
}

/// Type alias for message type names.
pub type MessageType = &'static str;

/// Whether `kind` is one of the names in [`MessageTypes`].
pub fn is_known_type(kind: &str) -> bool {
    MessageTypes::ALL.contains(&kind)
}
