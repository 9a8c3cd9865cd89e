//! Broker port and the normalization boundary.
//!
//! The transport behind this port is assumed synchronous request/response
//! and at-least-once on the network path: a call may time out after having
//! actually succeeded. The idempotency layer in the execution service
//! exists specifically to make repeated calls with the same client order id
//! safe.
//!
//! Broker responses arrive in loosely-shaped records (brokers disagree on
//! field names); `normalize_order` is the single place that maps a raw
//! record to the internal `AppOrder` shape.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::intent::OptionLeg;
use crate::domain::shared::{AccountId, BrokerOrderId, ClientOrderId, Symbol};

/// Broker-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Submitted, awaiting broker acknowledgment.
    PendingNew,
    /// Accepted and resting/working.
    Working,
    /// Partially filled.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Cancelled.
    Cancelled,
    /// Rejected by the broker.
    Rejected,
    /// Expired (e.g. day order at close).
    Expired,
}

impl OrderStatus {
    /// True while the order can still fill or be cancelled.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::PendingNew | Self::Working | Self::PartiallyFilled)
    }

    /// True once no further broker-side change is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired)
    }
}

/// Pricing style of a broker order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOrderType {
    /// Resting limit.
    Limit,
    /// Marketable.
    Market,
    /// Stop that converts to a limit at the trigger.
    StopLimit,
}

/// Request to submit an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOrderRequest {
    /// Idempotency key attached to the broker order.
    pub client_order_id: ClientOrderId,
    /// Owning account.
    pub account_id: AccountId,
    /// Instrument.
    pub symbol: Symbol,
    /// Legs of the structure, in intent order.
    pub legs: Vec<OptionLeg>,
    /// Spread quantity.
    pub quantity: u32,
    /// Order type.
    pub order_type: BrokerOrderType,
    /// Limit price (limit and stop-limit orders).
    pub limit_price: Option<Decimal>,
    /// Trigger price (stop-limit orders).
    pub stop_price: Option<Decimal>,
    /// Broker order this one is OCO-linked with, if any.
    pub oco_partner: Option<BrokerOrderId>,
}

/// Requested changes for a replace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceOrderRequest {
    /// New limit price.
    pub price: Option<Decimal>,
    /// New quantity.
    pub quantity: Option<Decimal>,
}

/// An account position as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Instrument.
    pub symbol: Symbol,
    /// Signed quantity (negative = short).
    pub quantity: Decimal,
    /// Average entry price.
    pub avg_price: Decimal,
}

/// Raw broker order record, before normalization.
///
/// Alternate field names carry the same value under different broker
/// response shapes; exactly one of each pair is expected to be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBrokerOrder {
    /// Broker order id (primary key name).
    #[serde(default)]
    pub id: Option<String>,
    /// Broker order id (alternate key name).
    #[serde(default)]
    pub order_id: Option<String>,
    /// Echoed client order id.
    #[serde(default)]
    pub client_order_id: Option<String>,
    /// Status string, e.g. "working", "FILLED".
    #[serde(default)]
    pub status: String,
    /// Requested quantity.
    #[serde(default)]
    pub quantity: Option<Decimal>,
    /// Filled quantity (primary key name).
    #[serde(default)]
    pub filled_quantity: Option<Decimal>,
    /// Filled quantity (alternate key name).
    #[serde(default)]
    pub filled_qty: Option<Decimal>,
    /// Average fill price (primary key name).
    #[serde(default)]
    pub avg_fill_price: Option<Decimal>,
    /// Average fill price (alternate key name).
    #[serde(default)]
    pub average_price: Option<Decimal>,
    /// Limit price, if any.
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    /// Order type string, e.g. "limit".
    #[serde(default)]
    pub order_type: Option<String>,
}

/// Normalized internal order shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppOrder {
    /// Broker-assigned id.
    pub broker_order_id: BrokerOrderId,
    /// Echoed client order id, when the broker returns it.
    pub client_order_id: Option<ClientOrderId>,
    /// Normalized status.
    pub status: OrderStatus,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Filled quantity.
    pub filled_quantity: Decimal,
    /// Average fill price, once any fill exists.
    pub avg_fill_price: Option<Decimal>,
    /// Limit price, if any.
    pub limit_price: Option<Decimal>,
    /// Whether the order is a limit order.
    pub is_limit: bool,
}

/// Broker port error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Connection-level failure.
    #[error("broker connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// The call timed out; it may still have succeeded broker-side.
    #[error("broker call timed out")]
    Timeout,

    /// Order refused by the broker.
    #[error("order rejected: {reason}")]
    OrderRejected {
        /// Rejection reason.
        reason: String,
    },

    /// Order not found.
    #[error("order not found: {order_id}")]
    OrderNotFound {
        /// The missing order id.
        order_id: String,
    },

    /// Rate limited.
    #[error("rate limited by broker")]
    RateLimited,

    /// Response could not be normalized.
    #[error("malformed broker response: {message}")]
    MalformedResponse {
        /// What was missing or unparseable.
        message: String,
    },

    /// Anything else.
    #[error("broker error: {message}")]
    Unknown {
        /// Error details.
        message: String,
    },
}

impl BrokerError {
    /// Whether a retry with the same client order id is worthwhile.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout | Self::RateLimited)
    }
}

/// Port for broker interactions.
///
/// The four order primitives plus position fetch; authentication and
/// session management live behind the implementation.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Submit an order.
    async fn submit_order(&self, request: &SubmitOrderRequest) -> Result<RawBrokerOrder, BrokerError>;

    /// Cancel an order.
    async fn cancel_order(
        &self,
        order_id: &BrokerOrderId,
        account_id: &AccountId,
    ) -> Result<(), BrokerError>;

    /// Replace price/quantity on a resting order.
    async fn replace_order(
        &self,
        order_id: &BrokerOrderId,
        account_id: &AccountId,
        changes: &ReplaceOrderRequest,
    ) -> Result<RawBrokerOrder, BrokerError>;

    /// Fetch the current state of an order.
    async fn get_order(
        &self,
        order_id: &BrokerOrderId,
        account_id: &AccountId,
    ) -> Result<RawBrokerOrder, BrokerError>;

    /// Fetch current account positions.
    async fn get_positions(&self, account_id: &AccountId) -> Result<Vec<Position>, BrokerError>;
}

/// Map a raw broker record to the internal `AppOrder` shape.
///
/// This is the only place broker field-name variability is handled.
///
/// # Errors
///
/// Returns `BrokerError::MalformedResponse` if the record carries no order
/// id or an unrecognized status.
pub fn normalize_order(raw: &RawBrokerOrder) -> Result<AppOrder, BrokerError> {
    let id = raw
        .id
        .as_deref()
        .or(raw.order_id.as_deref())
        .ok_or_else(|| BrokerError::MalformedResponse {
            message: "missing order id".to_string(),
        })?;

    let status = parse_status(&raw.status)?;
    let is_limit = raw
        .order_type
        .as_deref()
        .map(str::to_ascii_lowercase)
        .is_some_and(|t| t == "limit" || t == "stop_limit")
        || raw.limit_price.is_some();

    Ok(AppOrder {
        broker_order_id: BrokerOrderId::new(id),
        client_order_id: raw.client_order_id.as_deref().map(ClientOrderId::new),
        status,
        quantity: raw.quantity.unwrap_or_default(),
        filled_quantity: raw.filled_quantity.or(raw.filled_qty).unwrap_or_default(),
        avg_fill_price: raw.avg_fill_price.or(raw.average_price),
        limit_price: raw.limit_price,
        is_limit,
    })
}

fn parse_status(status: &str) -> Result<OrderStatus, BrokerError> {
    let normalized = status.to_ascii_lowercase();
    let parsed = match normalized.as_str() {
        "pending_new" | "pending" => OrderStatus::PendingNew,
        "new" | "accepted" | "working" | "open" => OrderStatus::Working,
        "partially_filled" | "partial" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "cancelled" | "canceled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        "expired" => OrderStatus::Expired,
        other => {
            return Err(BrokerError::MalformedResponse {
                message: format!("unrecognized order status '{other}'"),
            });
        }
    };
    Ok(parsed)
}
