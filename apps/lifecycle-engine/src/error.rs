//! Engine-level error taxonomy.
//!
//! Outcomes that are part of normal trade flow (gate rejections, risk
//! blocks, broker rejections) are not errors; they land in the trade record
//! and the execute outcome. `EngineError` covers caller mistakes and
//! infrastructure failures.

use thiserror::Error;

use crate::domain::intent::IntentError;
use crate::domain::shared::TradeId;
use crate::domain::state_machine::TradeState;
use crate::domain::trade::TradeError;
use crate::execution::ExecutionError;
use crate::persistence::StoreError;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The intent failed validation.
    #[error(transparent)]
    Validation(#[from] IntentError),

    /// Execution-layer failure that could not be absorbed into the trade
    /// record.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// A state transition was forbidden (e.g. a concurrent cancel landed
    /// first).
    #[error(transparent)]
    Trade(#[from] TradeError),

    /// Trade store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No trade with the given id.
    #[error("trade not found: {trade_id}")]
    TradeNotFound {
        /// The missing id.
        trade_id: TradeId,
    },

    /// Cancel requested in a state that does not allow it.
    #[error("trade {trade_id} is {state} and cannot be cancelled")]
    NotCancelable {
        /// The trade.
        trade_id: TradeId,
        /// Its current state.
        state: TradeState,
    },

    /// Close requested on a trade with no open position.
    #[error("trade {trade_id} is {state} and has no position to close")]
    NotCloseable {
        /// The trade.
        trade_id: TradeId,
        /// Its current state.
        state: TradeState,
    },
}
