//! Trade state machine.
//!
//! Validates lifecycle transitions before they are appended to a trade's
//! history.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::trade::TradeError;

/// Lifecycle state of an orchestrated trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    /// Intent accepted, nothing sent to the broker yet.
    Pending,
    /// Entry order acknowledged by the broker.
    Submitted,
    /// Entry order resting/working at the broker.
    Working,
    /// Entry order completely filled.
    Filled,
    /// Exit brackets placed and linked OCO.
    OcoAttached,
    /// Trade retired normally (bracket fill or manual close).
    Closed,
    /// Cancelled before fill (user or risk triggered).
    Cancelled,
    /// Rejected pre-submit (gate/risk) or by the broker.
    Rejected,
    /// Unrecoverable failure.
    Error,
}

impl TradeState {
    /// Returns true if no further transition may be appended.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Cancelled | Self::Rejected | Self::Error
        )
    }

    /// Returns true while the entry order can still be cancelled.
    #[must_use]
    pub const fn is_cancelable(&self) -> bool {
        matches!(self, Self::Submitted | Self::Working)
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Working => "WORKING",
            Self::Filled => "FILLED",
            Self::OcoAttached => "OCO_ATTACHED",
            Self::Closed => "CLOSED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Trade state machine for validating transitions.
pub struct TradeStateMachine;

impl TradeStateMachine {
    /// Check if a state transition is valid.
    #[must_use]
    pub fn is_valid_transition(from: TradeState, to: TradeState) -> bool {
        // Any non-terminal state may fall to Error on unrecoverable failure.
        if to == TradeState::Error && !from.is_terminal() {
            return true;
        }

        matches!(
            (from, to),
            // Happy path
            (TradeState::Pending, TradeState::Submitted)
                | (TradeState::Submitted, TradeState::Working)
                | (TradeState::Working, TradeState::Filled)
                | (TradeState::Filled, TradeState::OcoAttached)
                | (TradeState::OcoAttached, TradeState::Closed)
                // Fast fills may skip the Working observation
                | (TradeState::Submitted, TradeState::Filled)
                // Close without brackets (attach disabled or manual close)
                | (TradeState::Filled, TradeState::Closed)
                // Chase attempts re-record Working
                | (TradeState::Working, TradeState::Working)
                // Pre-submit rejection (gate, risk, validation)
                | (TradeState::Pending, TradeState::Rejected)
                // Broker rejection
                | (TradeState::Submitted, TradeState::Rejected)
                // User/risk cancel before fill
                | (TradeState::Submitted, TradeState::Cancelled)
                | (TradeState::Working, TradeState::Cancelled)
        )
    }

    /// Validate a state transition.
    ///
    /// # Errors
    ///
    /// Returns `TradeError::InvalidTransition` if the transition is invalid.
    pub fn validate_transition(from: TradeState, to: TradeState) -> Result<(), TradeError> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(TradeError::InvalidTransition {
                from,
                to,
                reason: Self::transition_error_reason(from, to),
            })
        }
    }

    /// Human-readable reason for an invalid transition.
    #[must_use]
    pub fn transition_error_reason(from: TradeState, to: TradeState) -> String {
        if from.is_terminal() {
            format!("trade is terminal in {from}, cannot transition to {to}")
        } else {
            format!("invalid transition from {from} to {to}")
        }
    }

    /// All valid next states from a given state.
    #[must_use]
    pub fn valid_next_states(from: TradeState) -> Vec<TradeState> {
        match from {
            TradeState::Pending => vec![
                TradeState::Submitted,
                TradeState::Rejected,
                TradeState::Error,
            ],
            TradeState::Submitted => vec![
                TradeState::Working,
                TradeState::Filled,
                TradeState::Rejected,
                TradeState::Cancelled,
                TradeState::Error,
            ],
            TradeState::Working => vec![
                TradeState::Working,
                TradeState::Filled,
                TradeState::Cancelled,
                TradeState::Error,
            ],
            TradeState::Filled => vec![
                TradeState::OcoAttached,
                TradeState::Closed,
                TradeState::Error,
            ],
            TradeState::OcoAttached => vec![TradeState::Closed, TradeState::Error],
            TradeState::Closed
            | TradeState::Cancelled
            | TradeState::Rejected
            | TradeState::Error => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let path = [
            TradeState::Pending,
            TradeState::Submitted,
            TradeState::Working,
            TradeState::Filled,
            TradeState::OcoAttached,
            TradeState::Closed,
        ];
        for pair in path.windows(2) {
            assert!(
                TradeStateMachine::is_valid_transition(pair[0], pair[1]),
                "{} -> {} should be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn pending_cannot_fill_directly() {
        assert!(!TradeStateMachine::is_valid_transition(
            TradeState::Pending,
            TradeState::Filled
        ));
    }

    #[test]
    fn cancel_only_before_fill() {
        assert!(TradeStateMachine::is_valid_transition(
            TradeState::Submitted,
            TradeState::Cancelled
        ));
        assert!(TradeStateMachine::is_valid_transition(
            TradeState::Working,
            TradeState::Cancelled
        ));
        assert!(!TradeStateMachine::is_valid_transition(
            TradeState::Filled,
            TradeState::Cancelled
        ));
    }

    #[test]
    fn any_active_state_can_error() {
        for state in [
            TradeState::Pending,
            TradeState::Submitted,
            TradeState::Working,
            TradeState::Filled,
            TradeState::OcoAttached,
        ] {
            assert!(TradeStateMachine::is_valid_transition(
                state,
                TradeState::Error
            ));
        }
    }

    #[test]
    fn no_transitions_from_terminal_states() {
        for terminal in [
            TradeState::Closed,
            TradeState::Cancelled,
            TradeState::Rejected,
            TradeState::Error,
        ] {
            assert!(TradeStateMachine::valid_next_states(terminal).is_empty());
            assert!(!TradeStateMachine::is_valid_transition(
                terminal,
                TradeState::Error
            ));
        }
    }

    #[test]
    fn chase_re_records_working() {
        assert!(TradeStateMachine::is_valid_transition(
            TradeState::Working,
            TradeState::Working
        ));
    }

    #[test]
    fn validate_transition_returns_error_for_invalid() {
        let result =
            TradeStateMachine::validate_transition(TradeState::Closed, TradeState::Working);
        assert!(result.is_err());
    }

    #[test]
    fn transition_error_reason_mentions_terminal() {
        let reason =
            TradeStateMachine::transition_error_reason(TradeState::Closed, TradeState::Working);
        assert!(reason.contains("terminal"));
    }
}
