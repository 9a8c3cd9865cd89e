//! Trade aggregate.
//!
//! A `Trade` is the orchestrated unit: the intent it was created from, its
//! current state, and an append-only sequence of transitions. It is owned
//! exclusively by the orchestrator and mutated only through `transition`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::intent::TradeIntent;
use super::state_machine::{TradeState, TradeStateMachine};
use crate::domain::shared::{BrokerOrderId, TradeId};

/// Error raised by trade mutations.
#[derive(Debug, Clone, Error)]
pub enum TradeError {
    /// The requested transition is not allowed by the state machine.
    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        /// Current state.
        from: TradeState,
        /// Requested state.
        to: TradeState,
        /// Why it is invalid.
        reason: String,
    },
}

/// One recorded state transition.
///
/// History entries are never rewritten; failures carry the originating
/// error text for after-the-fact audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// State before.
    pub from: TradeState,
    /// State after.
    pub to: TradeState,
    /// When the transition was recorded.
    pub at: DateTime<Utc>,
    /// Error text for failure transitions.
    pub error: Option<String>,
    /// Free-form annotation (e.g. chase attempt details).
    pub note: Option<String>,
}

/// The orchestrated unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    id: TradeId,
    intent: TradeIntent,
    state: TradeState,
    transitions: Vec<Transition>,
    entry_order_id: Option<BrokerOrderId>,
    take_profit_order_id: Option<BrokerOrderId>,
    stop_loss_order_id: Option<BrokerOrderId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Trade {
    /// Create a new trade in `Pending` from an intent.
    #[must_use]
    pub fn new(intent: TradeIntent) -> Self {
        let now = Utc::now();
        Self {
            id: TradeId::generate(),
            intent,
            state: TradeState::Pending,
            transitions: Vec::new(),
            entry_order_id: None,
            take_profit_order_id: None,
            stop_loss_order_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Trade ID.
    #[must_use]
    pub const fn id(&self) -> &TradeId {
        &self.id
    }

    /// The originating intent (read-only).
    #[must_use]
    pub const fn intent(&self) -> &TradeIntent {
        &self.intent
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> TradeState {
        self.state
    }

    /// Append-only transition history.
    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Entry broker order id, once known.
    #[must_use]
    pub const fn entry_order_id(&self) -> Option<&BrokerOrderId> {
        self.entry_order_id.as_ref()
    }

    /// Take-profit broker order id, once brackets are attached.
    #[must_use]
    pub const fn take_profit_order_id(&self) -> Option<&BrokerOrderId> {
        self.take_profit_order_id.as_ref()
    }

    /// Stop-loss broker order id, once brackets are attached.
    #[must_use]
    pub const fn stop_loss_order_id(&self) -> Option<&BrokerOrderId> {
        self.stop_loss_order_id.as_ref()
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last mutation timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Record the broker id of the entry order.
    pub fn set_entry_order_id(&mut self, id: BrokerOrderId) {
        self.entry_order_id = Some(id);
        self.updated_at = Utc::now();
    }

    /// Record the broker ids of the attached exit brackets.
    pub fn set_bracket_order_ids(&mut self, take_profit: BrokerOrderId, stop_loss: BrokerOrderId) {
        self.take_profit_order_id = Some(take_profit);
        self.stop_loss_order_id = Some(stop_loss);
        self.updated_at = Utc::now();
    }

    /// Transition to a new state, appending a history record.
    ///
    /// # Errors
    ///
    /// Returns `TradeError::InvalidTransition` if the state machine forbids
    /// the move (including any transition out of a terminal state).
    pub fn transition(&mut self, to: TradeState) -> Result<(), TradeError> {
        self.transition_with(to, None, None)
    }

    /// Transition to a failure state, attaching the triggering error text.
    ///
    /// # Errors
    ///
    /// Returns `TradeError::InvalidTransition` if the move is forbidden.
    pub fn transition_with_error(
        &mut self,
        to: TradeState,
        error: impl Into<String>,
    ) -> Result<(), TradeError> {
        self.transition_with(to, Some(error.into()), None)
    }

    /// Transition with an annotation (e.g. a chase attempt record).
    ///
    /// # Errors
    ///
    /// Returns `TradeError::InvalidTransition` if the move is forbidden.
    pub fn transition_with_note(
        &mut self,
        to: TradeState,
        note: impl Into<String>,
    ) -> Result<(), TradeError> {
        self.transition_with(to, None, Some(note.into()))
    }

    fn transition_with(
        &mut self,
        to: TradeState,
        error: Option<String>,
        note: Option<String>,
    ) -> Result<(), TradeError> {
        TradeStateMachine::validate_transition(self.state, to)?;

        let now = Utc::now();
        self.transitions.push(Transition {
            from: self.state,
            to,
            at: now,
            error,
            note,
        });
        self.state = to;
        self.updated_at = now;
        Ok(())
    }
}
