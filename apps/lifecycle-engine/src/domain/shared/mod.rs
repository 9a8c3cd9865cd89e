//! Shared domain primitives used across all modules.

mod identifiers;

pub use identifiers::{AccountId, BrokerOrderId, ClientOrderId, Symbol, TradeId};
