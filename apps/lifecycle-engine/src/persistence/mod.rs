//! Trade persistence port.
//!
//! The orchestrator writes the trade record back after every state change
//! so a crash never loses more than the in-flight transition.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::shared::TradeId;
use crate::domain::trade::Trade;

/// Persistence failure.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The trade does not exist.
    #[error("trade not found: {trade_id}")]
    NotFound {
        /// The missing id.
        trade_id: TradeId,
    },

    /// Backend failure.
    #[error("trade store error: {message}")]
    Backend {
        /// Error details.
        message: String,
    },
}

/// Port for trade persistence.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert or overwrite a trade record.
    async fn save(&self, trade: &Trade) -> Result<(), StoreError>;

    /// Fetch a trade by id.
    async fn get(&self, trade_id: &TradeId) -> Option<Trade>;

    /// All trades in non-terminal states.
    async fn open_trades(&self) -> Vec<Trade>;

    /// Count of trades in non-terminal states.
    async fn open_trade_count(&self) -> usize {
        self.open_trades().await.len()
    }
}

/// In-memory trade store for a single-process deployment.
#[derive(Debug, Default)]
pub struct InMemoryTradeStore {
    trades: RwLock<HashMap<TradeId, Trade>>,
}

impl InMemoryTradeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trades held, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trades.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.read().is_empty()
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn save(&self, trade: &Trade) -> Result<(), StoreError> {
        self.trades.write().insert(trade.id().clone(), trade.clone());
        Ok(())
    }

    async fn get(&self, trade_id: &TradeId) -> Option<Trade> {
        self.trades.read().get(trade_id).cloned()
    }

    async fn open_trades(&self) -> Vec<Trade> {
        self.trades
            .read()
            .values()
            .filter(|trade| !trade.state().is_terminal())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::intent::{ExitRules, LegAction, OptionLeg, OptionRight, OrderKind, Provenance, TradeIntent};
    use crate::domain::shared::{AccountId, Symbol};
    use crate::domain::state_machine::TradeState;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn trade() -> Trade {
        let expiry = NaiveDate::from_ymd_opt(2026, 9, 18).unwrap();
        Trade::new(TradeIntent {
            symbol: Symbol::new("SPY"),
            legs: vec![OptionLeg {
                action: LegAction::Sell,
                right: OptionRight::Put,
                strike: dec!(500),
                expiry,
                quantity: 1,
            }],
            quantity: 1,
            order_kind: OrderKind::Market,
            limit_price: None,
            exit_rules: ExitRules {
                take_profit_pct: dec!(50),
                stop_loss_pct: dec!(100),
                time_exit: None,
            },
            target_delta_points: None,
            account_id: AccountId::new("acct-1"),
            provenance: Provenance::Manual,
            strategy: None,
            strategy_version: None,
        })
    }

    #[tokio::test]
    async fn save_and_fetch() {
        let store = InMemoryTradeStore::new();
        let trade = trade();
        store.save(&trade).await.unwrap();

        let fetched = store.get(trade.id()).await.unwrap();
        assert_eq!(fetched.id(), trade.id());
        assert_eq!(fetched.state(), TradeState::Pending);
    }

    #[tokio::test]
    async fn open_trades_excludes_terminal() {
        let store = InMemoryTradeStore::new();

        let open = trade();
        store.save(&open).await.unwrap();

        let mut cancelled = trade();
        cancelled.transition(TradeState::Submitted).unwrap();
        cancelled.transition(TradeState::Cancelled).unwrap();
        store.save(&cancelled).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.open_trade_count().await, 1);
        assert_eq!(store.open_trades().await[0].id(), open.id());
    }
}
