//! Domain layer - trade intents, the trade aggregate, and its state machine.

pub mod intent;
pub mod shared;
pub mod state_machine;
pub mod trade;

pub use intent::{ExitRules, IntentError, LegAction, OptionLeg, OptionRight, OrderKind, Provenance, TradeIntent};
pub use state_machine::{TradeState, TradeStateMachine};
pub use trade::{Trade, TradeError, Transition};
