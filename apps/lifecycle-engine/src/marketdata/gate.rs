//! Greeks/freshness gate.
//!
//! Pure validation functions over market snapshots. The orchestrator treats
//! any gate failure as a hard stop before the broker is contacted.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::cache::MarketSnapshot;

/// Default maximum tolerated quote age before an order may be submitted.
pub const DEFAULT_MAX_STALENESS_MS: i64 = 500;

/// Default delta drift tolerance in delta points.
pub const DEFAULT_DELTA_TOLERANCE_POINTS: Decimal = dec!(2);

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Check passed.
    Pass,
    /// Check failed; the reason is recorded on the rejection transition.
    Fail {
        /// Human-readable failure reason.
        reason: String,
    },
}

impl GateDecision {
    /// Whether the check passed.
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// The failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::Fail { reason } => Some(reason),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }
}

/// Check that the snapshot is fresh enough to trade on.
#[must_use]
pub fn check_freshness(snapshot: &MarketSnapshot, max_staleness_ms: i64) -> GateDecision {
    if snapshot.staleness_ms > max_staleness_ms {
        GateDecision::fail(format!(
            "quote for {} is {}ms stale (max {}ms)",
            snapshot.symbol, snapshot.staleness_ms, max_staleness_ms
        ))
    } else {
        GateDecision::Pass
    }
}

/// Check that the current delta has not drifted from the intended target.
///
/// Compares `||delta| x 100 - target_points|` against the tolerance; a
/// snapshot without Greeks fails.
#[must_use]
pub fn check_delta_drift(
    snapshot: &MarketSnapshot,
    target_delta_points: Decimal,
    tolerance_points: Decimal,
) -> GateDecision {
    let Some(greeks) = snapshot.greeks else {
        return GateDecision::fail(format!("no Greeks cached for {}", snapshot.symbol));
    };

    let current_points = greeks.delta.abs() * dec!(100);
    let drift = (current_points - target_delta_points).abs();
    if drift > tolerance_points {
        GateDecision::fail(format!(
            "delta drifted {drift} points from target {target_delta_points} (tolerance {tolerance_points})"
        ))
    } else {
        GateDecision::Pass
    }
}

/// Run the full pre-submit gate: freshness, then optional delta drift.
///
/// A `None` snapshot (symbol never seen) fails outright.
#[must_use]
pub fn evaluate(
    snapshot: Option<&MarketSnapshot>,
    max_staleness_ms: i64,
    target_delta_points: Option<Decimal>,
    tolerance_points: Decimal,
) -> GateDecision {
    let Some(snapshot) = snapshot else {
        return GateDecision::fail("no market data cached for symbol");
    };

    let freshness = check_freshness(snapshot, max_staleness_ms);
    if !freshness.is_pass() {
        return freshness;
    }

    if let Some(target) = target_delta_points {
        return check_delta_drift(snapshot, target, tolerance_points);
    }

    GateDecision::Pass
}
