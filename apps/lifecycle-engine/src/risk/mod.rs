//! Risk rule engine: data-driven rules evaluated in priority order.

mod engine;
mod rule;

pub use engine::{RiskDecision, RiskEngine, TriggeredRule};
pub use rule::{RiskContext, RiskRule, RuleAction, RuleCondition};
