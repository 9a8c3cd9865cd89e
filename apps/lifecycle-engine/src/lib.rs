// Allow unwrap/expect and other test-only patterns in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Lifecycle Engine - trade lifecycle orchestration for options spreads.
//!
//! The engine drives a trade from intent to close through a strict state
//! machine:
//!
//! ```text
//! PENDING -> SUBMITTED -> WORKING -> FILLED -> OCO_ATTACHED -> CLOSED
//! ```
//!
//! # Layers
//!
//! - **Domain**: intents, the trade aggregate, and the state machine.
//! - **Market data**: per-symbol quote/Greeks cache with staleness sweeps,
//!   and the pre-submit freshness/delta gate.
//! - **Registry**: idempotency records keyed by client order id and OCO
//!   bracket group bookkeeping.
//! - **Execution**: the broker port, response normalization, bracket price
//!   derivation, retries, and the idempotent execution service.
//! - **Risk**: data-driven rules evaluated in priority order.
//! - **Orchestrator**: wires the above into the lifecycle.
//!
//! # Guarantees
//!
//! - At most one broker submission per client order id; replayed submits
//!   resolve to a status fetch.
//! - Bracket prices always derive from the realized entry price.
//! - Terminal trade states are immutable; every transition is recorded.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Configuration loading and validation.
pub mod config;

/// Domain layer: intents, trades, and the state machine.
pub mod domain;

/// Engine-level error taxonomy.
pub mod error;

/// Execution layer: broker port, brackets, retries, and the service.
pub mod execution;

/// Market-data cache and pre-submit gate.
pub mod marketdata;

/// Logging initialization.
pub mod observability;

/// Trade lifecycle orchestration.
pub mod orchestrator;

/// Trade persistence port.
pub mod persistence;

/// Idempotency and OCO group registry.
pub mod registry;

/// Risk rule engine.
pub mod risk;

pub use config::{load_config, Config, ConfigError};
pub use domain::intent::{
    ExitRules, LegAction, OptionLeg, OptionRight, OrderKind, Provenance, TradeIntent,
};
pub use domain::shared::{AccountId, BrokerOrderId, ClientOrderId, Symbol, TradeId};
pub use domain::state_machine::TradeState;
pub use domain::trade::Trade;
pub use error::EngineError;
pub use execution::{BrokerPort, ExecutionService, PaperBroker};
pub use marketdata::{MarketStateCache, QuoteEvent};
pub use orchestrator::{ExecuteOptions, ExecuteOutcome, Orchestrator};
pub use persistence::{InMemoryTradeStore, TradeStore};
pub use registry::{InMemoryOrderRegistry, OrderRegistry};
pub use risk::{RiskEngine, RiskRule};
