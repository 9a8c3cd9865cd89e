//! Market data - the per-symbol state cache and the pre-submit gate.

pub mod cache;
pub mod gate;

pub use cache::{Greeks, MarketSnapshot, MarketStateCache, QuoteEvent, StalenessAlert};
pub use gate::GateDecision;
