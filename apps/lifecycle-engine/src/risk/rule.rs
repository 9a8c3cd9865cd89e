//! Risk rule types.
//!
//! Rules are data, not code: they are loaded from configuration, evaluated
//! in priority order, and can be swapped at runtime without a restart.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a rule checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Short delta magnitude (in points) exceeds a ceiling.
    DeltaBreach {
        /// Maximum tolerated short delta, in points.
        max_delta_points: Decimal,
    },
    /// The position's configured time exit has been reached.
    TimeExit,
    /// Open trade count is at or above a ceiling.
    PortfolioLimit {
        /// Maximum concurrently open trades.
        max_open_trades: usize,
    },
    /// Caller-defined flag raised on the evaluation context.
    Custom {
        /// Flag name matched against `RiskContext::flags`.
        flag: String,
    },
}

/// What happens when a rule triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Refuse to open the trade.
    BlockTrade,
    /// Force-close the open position.
    CloseTrade,
    /// Record an alert, continue evaluation.
    Alert,
}

/// One configured risk rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRule {
    /// Stable rule id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Rule set this rule belongs to (e.g. "default", "earnings-week").
    pub rule_set: String,
    /// Evaluation order; lower runs first.
    pub priority: u32,
    /// Trigger condition.
    pub condition: RuleCondition,
    /// Action when triggered.
    pub action: RuleAction,
    /// Disabled rules are skipped entirely.
    pub enabled: bool,
}

/// Snapshot of the world a rule set is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RiskContext {
    /// Trades currently open (counted before this one, for entry checks).
    pub open_trades: usize,
    /// Current short delta in points, when known.
    pub short_delta_points: Option<Decimal>,
    /// Evaluation time.
    pub now: Option<DateTime<Utc>>,
    /// The position's configured time exit, if any.
    pub time_exit: Option<DateTime<Utc>>,
    /// Caller-raised flags for custom rules.
    pub flags: HashSet<String>,
}

impl RiskContext {
    /// Whether a condition currently holds against this context.
    #[must_use]
    pub fn triggers(&self, condition: &RuleCondition) -> bool {
        match condition {
            RuleCondition::DeltaBreach { max_delta_points } => self
                .short_delta_points
                .is_some_and(|delta| delta.abs() > *max_delta_points),
            RuleCondition::TimeExit => match (self.now, self.time_exit) {
                (Some(now), Some(exit)) => now >= exit,
                _ => false,
            },
            RuleCondition::PortfolioLimit { max_open_trades } => {
                self.open_trades >= *max_open_trades
            }
            RuleCondition::Custom { flag } => self.flags.contains(flag),
        }
    }
}
