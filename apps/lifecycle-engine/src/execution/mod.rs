//! Execution layer: broker port, bracket pricing, retries, and the
//! idempotent execution service.

pub mod bracket;
pub mod broker;
pub mod paper;
pub mod retry;
pub mod service;

pub use bracket::{derive_bracket_prices, BracketError, BracketPrices};
pub use broker::{
    normalize_order, AppOrder, BrokerError, BrokerOrderType, BrokerPort, OrderStatus, Position,
    RawBrokerOrder, ReplaceOrderRequest, SubmitOrderRequest,
};
pub use paper::PaperBroker;
pub use retry::{Backoff, RetryPolicy};
pub use service::{CancelOutcome, ExecutionError, ExecutionService, SubmitOutcome};
