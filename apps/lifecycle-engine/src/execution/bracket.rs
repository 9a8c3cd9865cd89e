//! Bracket price derivation.
//!
//! All bracket prices are derived from the actual fill/entry price, never
//! from the original signal price: a last-second price adjustment at entry
//! must not desynchronize the exit targets from the realized cost basis.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::domain::intent::OptionLeg;

/// Bracket validation/pricing failure.
#[derive(Debug, Clone, Error)]
pub enum BracketError {
    /// A bracket percentage was not positive.
    #[error("invalid bracket percentage: {message}")]
    InvalidPercentage {
        /// What is wrong.
        message: String,
    },

    /// The legs do not form a complete spread.
    #[error("legs do not form a complete spread: {message}")]
    IncompleteSpread {
        /// What is wrong.
        message: String,
    },

    /// Entry price must be positive to derive exits.
    #[error("entry price must be positive, got {price}")]
    InvalidEntryPrice {
        /// The offending price.
        price: Decimal,
    },
}

/// Derived bracket prices for a credit structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketPrices {
    /// Take-profit buy-back limit price.
    pub take_profit: Decimal,
    /// Stop-loss trigger price.
    pub stop_loss: Decimal,
}

/// Check that legs form a complete vertical spread.
///
/// # Errors
///
/// Returns `BracketError::IncompleteSpread` describing the first violated
/// requirement.
pub fn validate_spread(legs: &[OptionLeg]) -> Result<(), BracketError> {
    if legs.len() != 2 {
        return Err(BracketError::IncompleteSpread {
            message: format!("expected 2 legs, got {}", legs.len()),
        });
    }
    let (a, b) = (&legs[0], &legs[1]);
    if a.action == b.action {
        return Err(BracketError::IncompleteSpread {
            message: "both legs on the same side".to_string(),
        });
    }
    if a.right != b.right || a.expiry != b.expiry {
        return Err(BracketError::IncompleteSpread {
            message: "legs differ in right or expiry".to_string(),
        });
    }
    if a.strike == b.strike {
        return Err(BracketError::IncompleteSpread {
            message: "legs share a strike".to_string(),
        });
    }
    Ok(())
}

/// Maximum loss per contract for a credit vertical: spread width minus the
/// credit collected at entry.
#[must_use]
pub fn max_loss_per_contract(legs: &[OptionLeg], entry_price: Decimal) -> Decimal {
    let width = (legs[0].strike - legs[1].strike).abs();
    (width - entry_price).max(Decimal::ZERO)
}

/// Derive bracket prices from the realized entry price.
///
/// For a sold (credit) structure the take-profit is a buy-back at
/// `entry x (1 - tp_pct/100)` and the stop-loss triggers at
/// `entry + sl_pct/100 x max_loss_per_contract`. Prices are rounded to the
/// cent.
///
/// # Errors
///
/// Returns a `BracketError` if a percentage is not positive, the entry
/// price is not positive, or the legs do not form a complete spread.
pub fn derive_bracket_prices(
    legs: &[OptionLeg],
    entry_price: Decimal,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
) -> Result<BracketPrices, BracketError> {
    if take_profit_pct <= Decimal::ZERO {
        return Err(BracketError::InvalidPercentage {
            message: format!("take-profit pct {take_profit_pct} must be positive"),
        });
    }
    if stop_loss_pct <= Decimal::ZERO {
        return Err(BracketError::InvalidPercentage {
            message: format!("stop-loss pct {stop_loss_pct} must be positive"),
        });
    }
    if entry_price <= Decimal::ZERO {
        return Err(BracketError::InvalidEntryPrice { price: entry_price });
    }
    validate_spread(legs)?;

    let hundred = dec!(100);
    let take_profit = entry_price * (Decimal::ONE - take_profit_pct / hundred);
    let stop_loss =
        entry_price + stop_loss_pct / hundred * max_loss_per_contract(legs, entry_price);

    Ok(BracketPrices {
        take_profit: take_profit.round_dp(2),
        stop_loss: stop_loss.round_dp(2),
    })
}
