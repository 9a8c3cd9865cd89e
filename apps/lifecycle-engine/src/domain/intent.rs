//! Trade intent - the immutable request to trade.
//!
//! A `TradeIntent` is constructed once by an external caller (webhook
//! parser, scheduler, manual entry) and is read-only to the engine.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::shared::{AccountId, Symbol};

/// Validation failure for a trade intent.
#[derive(Debug, Clone, Error)]
pub enum IntentError {
    /// A required field is missing or malformed.
    #[error("invalid intent field '{field}': {message}")]
    InvalidField {
        /// Field name.
        field: String,
        /// What is wrong with it.
        message: String,
    },
}

impl IntentError {
    fn field(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Buy or sell a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegAction {
    /// Buy to open/close.
    Buy,
    /// Sell to open/close.
    Sell,
}

impl LegAction {
    /// The opposite action, used when building closing orders.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionRight {
    /// Call option.
    Call,
    /// Put option.
    Put,
}

/// Order pricing style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    /// Resting limit order.
    Limit,
    /// Marketable order.
    Market,
}

/// How the intent entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Entered by a human.
    Manual,
    /// Parsed from an inbound webhook/alert.
    Webhook,
    /// Produced by a scheduled job.
    Scheduled,
}

/// One leg of an option structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionLeg {
    /// Buy or sell.
    pub action: LegAction,
    /// Call or put.
    pub right: OptionRight,
    /// Strike price.
    pub strike: Decimal,
    /// Expiry date.
    pub expiry: NaiveDate,
    /// Contracts for this leg.
    pub quantity: u32,
}

/// Exit rules attached to an intent.
///
/// Percentages are interpreted against the realized entry price, never the
/// signal price the intent was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRules {
    /// Take-profit percentage of entry credit to capture.
    pub take_profit_pct: Decimal,
    /// Stop-loss percentage of max loss to tolerate.
    pub stop_loss_pct: Decimal,
    /// Optional hard time exit.
    pub time_exit: Option<DateTime<Utc>>,
}

/// Immutable request to trade an option structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    /// Instrument being traded (underlying ticker).
    pub symbol: Symbol,
    /// Ordered legs of the structure.
    pub legs: Vec<OptionLeg>,
    /// Target quantity (spreads, not per-leg contracts).
    pub quantity: u32,
    /// Limit or market.
    pub order_kind: OrderKind,
    /// Limit price, required for limit orders.
    pub limit_price: Option<Decimal>,
    /// Take-profit / stop-loss / time-exit bundle.
    pub exit_rules: ExitRules,
    /// Target short delta in points (e.g. 30 for a 0.30-delta short leg),
    /// used by the pre-submit drift gate when present.
    pub target_delta_points: Option<Decimal>,
    /// Owning account.
    pub account_id: AccountId,
    /// How this intent entered the system.
    pub provenance: Provenance,
    /// Optional strategy tag.
    pub strategy: Option<String>,
    /// Optional strategy version tag.
    pub strategy_version: Option<String>,
}

impl TradeIntent {
    /// Validate the intent before any side effect.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant: at least one leg, positive
    /// quantity, a positive limit price on limit orders, non-negative exit
    /// percentages, and positive per-leg strikes/quantities.
    pub fn validate(&self) -> Result<(), IntentError> {
        if self.legs.is_empty() {
            return Err(IntentError::field("legs", "at least one leg is required"));
        }

        if self.quantity == 0 {
            return Err(IntentError::field("quantity", "quantity must be positive"));
        }

        match self.order_kind {
            OrderKind::Limit => match self.limit_price {
                Some(price) if price > Decimal::ZERO => {}
                Some(_) => {
                    return Err(IntentError::field(
                        "limit_price",
                        "limit price must be positive",
                    ));
                }
                None => {
                    return Err(IntentError::field(
                        "limit_price",
                        "limit orders require a limit price",
                    ));
                }
            },
            OrderKind::Market => {}
        }

        if self.exit_rules.take_profit_pct < Decimal::ZERO {
            return Err(IntentError::field(
                "take_profit_pct",
                "percentage must be non-negative",
            ));
        }
        if self.exit_rules.stop_loss_pct < Decimal::ZERO {
            return Err(IntentError::field(
                "stop_loss_pct",
                "percentage must be non-negative",
            ));
        }

        for (i, leg) in self.legs.iter().enumerate() {
            if leg.strike <= Decimal::ZERO {
                return Err(IntentError::field(
                    "legs",
                    format!("leg {i}: strike must be positive"),
                ));
            }
            if leg.quantity == 0 {
                return Err(IntentError::field(
                    "legs",
                    format!("leg {i}: quantity must be positive"),
                ));
            }
        }

        Ok(())
    }

    /// Whether the legs form a complete vertical spread: exactly one bought
    /// and one sold leg with the same right and expiry, different strikes.
    #[must_use]
    pub fn is_complete_spread(&self) -> bool {
        if self.legs.len() != 2 {
            return false;
        }
        let (a, b) = (&self.legs[0], &self.legs[1]);
        a.action != b.action && a.right == b.right && a.expiry == b.expiry && a.strike != b.strike
    }

    /// Absolute strike width of a two-leg structure.
    ///
    /// Returns `None` unless the intent is a complete spread.
    #[must_use]
    pub fn spread_width(&self) -> Option<Decimal> {
        if self.is_complete_spread() {
            Some((self.legs[0].strike - self.legs[1].strike).abs())
        } else {
            None
        }
    }
}
