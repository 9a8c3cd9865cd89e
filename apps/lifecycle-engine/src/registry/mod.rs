//! Order registry - durable idempotency bookkeeping.
//!
//! Maps locally generated client order ids to submission status so a
//! replayed submit call (e.g. a caller retrying after a network timeout)
//! can be recognized and never reaches the broker twice. Also stores OCO
//! bracket group associations keyed by the filled entry order.

mod memory;

pub use memory::InMemoryOrderRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::intent::OptionLeg;
use crate::domain::shared::{AccountId, BrokerOrderId, ClientOrderId, TradeId};

/// Registry error.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A non-failed record already maps to this broker order id.
    #[error("broker order {broker_order_id} already registered")]
    DuplicateBrokerOrder {
        /// The conflicting broker order id.
        broker_order_id: BrokerOrderId,
    },

    /// The client order id belongs to a different trade.
    #[error("client order id {key} is owned by trade {owner}")]
    KeyOwnedByOtherTrade {
        /// The contested key.
        key: ClientOrderId,
        /// The trade that owns it.
        owner: TradeId,
    },

    /// A live (non-failed) record for this key already exists; retries may
    /// only replace a failed record with a higher retry count.
    #[error("client order id {key} already has an outstanding submission")]
    SubmissionOutstanding {
        /// The contested key.
        key: ClientOrderId,
    },

    /// No record exists for the key.
    #[error("no record for client order id {key}")]
    RecordNotFound {
        /// The missing key.
        key: ClientOrderId,
    },

    /// No OCO group exists for the entry order.
    #[error("no OCO group for entry order {entry_order_id}")]
    GroupNotFound {
        /// The missing entry order id.
        entry_order_id: BrokerOrderId,
    },
}

/// Submission lifecycle status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Recorded locally; broker call in flight or about to be.
    Submitted,
    /// Broker acknowledged; broker order id attached. The commit point.
    Confirmed,
    /// Broker call failed; the key may be reused by a later retry of the
    /// same trade attempt.
    Failed,
}

/// Idempotency record keyed by client order id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The idempotency key.
    pub client_order_id: ClientOrderId,
    /// Owning trade.
    pub trade_id: TradeId,
    /// Lifecycle status.
    pub status: SubmissionStatus,
    /// Retry count for this trade attempt.
    pub retry_count: u32,
    /// Broker-assigned order id, set once confirmed.
    pub broker_order_id: Option<BrokerOrderId>,
    /// Failure reason, set by `mark_failed`.
    pub failure_reason: Option<String>,
    /// Opaque caller metadata.
    pub metadata: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// OCO bracket group, keyed by the broker id of the filled entry order.
///
/// Created at fill time, updated when a bracket leg is replaced or
/// cancelled, never duplicated for the same entry order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoGroup {
    /// Entry order this group brackets.
    pub entry_order_id: BrokerOrderId,
    /// Owning account.
    pub account_id: AccountId,
    /// Take-profit percentage of entry credit.
    pub take_profit_pct: Decimal,
    /// Stop-loss percentage of max loss.
    pub stop_loss_pct: Decimal,
    /// Realized entry price the bracket prices were derived from.
    pub entry_price: Decimal,
    /// Entry legs (used to build the closing orders).
    pub legs: Vec<OptionLeg>,
    /// Take-profit order id, once placed.
    pub take_profit_order_id: Option<BrokerOrderId>,
    /// Stop-loss order id, once placed.
    pub stop_loss_order_id: Option<BrokerOrderId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Port for idempotency and bracket-group bookkeeping.
///
/// Implementations must be safe for concurrent use from multiple trade
/// tasks.
#[async_trait]
pub trait OrderRegistry: Send + Sync {
    /// Produce a fresh client order id, unique within process lifetime.
    fn generate_client_order_id(&self) -> ClientOrderId {
        ClientOrderId::fresh()
    }

    /// Create or overwrite the pending record for `key`.
    ///
    /// A failed record may be replaced by a retry of the same trade with a
    /// strictly higher retry count; a live record, or a record owned by a
    /// different trade, is never overwritten.
    async fn record_submission(
        &self,
        key: &ClientOrderId,
        trade_id: &TradeId,
        retry_count: u32,
        metadata: serde_json::Value,
    ) -> Result<(), RegistryError>;

    /// Mark the record confirmed and attach the broker order id.
    ///
    /// This is the single commit point after which the order is treated as
    /// real. At most one non-failed record may map to a broker order id.
    async fn confirm_submission(
        &self,
        key: &ClientOrderId,
        broker_order_id: &BrokerOrderId,
    ) -> Result<(), RegistryError>;

    /// Mark the record failed with a reason.
    async fn mark_failed(&self, key: &ClientOrderId, reason: &str) -> Result<(), RegistryError>;

    /// Whether a non-failed record exists for the key.
    async fn is_submitted(&self, key: &ClientOrderId) -> bool;

    /// Fetch the record for a key, if any.
    async fn get_order(&self, key: &ClientOrderId) -> Option<IdempotencyRecord>;

    /// Store a new OCO group for an entry order.
    async fn store_oco_group(&self, group: OcoGroup) -> Result<(), RegistryError>;

    /// Fetch the OCO group for an entry order, if any.
    async fn get_oco_group(&self, entry_order_id: &BrokerOrderId) -> Option<OcoGroup>;

    /// Replace the stored OCO group for an entry order.
    async fn update_oco_group(&self, group: OcoGroup) -> Result<(), RegistryError>;
}
