//! Priority-ordered risk rule evaluation.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::rule::{RiskContext, RiskRule, RuleAction};

/// A rule that fired during evaluation.
#[derive(Debug, Clone)]
pub struct TriggeredRule {
    /// Rule id.
    pub rule_id: String,
    /// Rule name, used in audit messages.
    pub rule_name: String,
    /// The action the rule demands.
    pub action: RuleAction,
}

/// Outcome of evaluating a rule set against a context.
///
/// Blocking actions are first-match-wins in priority order; alert rules
/// accumulate and never stop evaluation.
#[derive(Debug, Clone, Default)]
pub struct RiskDecision {
    /// The first blocking or closing rule that fired, if any.
    pub blocking: Option<TriggeredRule>,
    /// All alert rules that fired before evaluation stopped.
    pub alerts: Vec<TriggeredRule>,
}

impl RiskDecision {
    /// Whether any blocking or closing rule fired.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        self.blocking.is_some()
    }
}

/// Risk rule engine with atomically swappable rule sets.
#[derive(Debug, Default)]
pub struct RiskEngine {
    rules: RwLock<Arc<Vec<RiskRule>>>,
}

impl RiskEngine {
    /// An engine with no rules; everything passes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine loaded with an initial rule set.
    #[must_use]
    pub fn with_rules(rules: Vec<RiskRule>) -> Self {
        let engine = Self::new();
        engine.reload(rules);
        engine
    }

    /// Replace the active rules in one step. Evaluations already running
    /// keep the set they started with.
    pub fn reload(&self, mut rules: Vec<RiskRule>) {
        rules.sort_by_key(|rule| rule.priority);
        info!(count = rules.len(), "risk rules reloaded");
        *self.rules.write() = Arc::new(rules);
    }

    /// Snapshot of the active rules, in evaluation order.
    #[must_use]
    pub fn rules(&self) -> Arc<Vec<RiskRule>> {
        Arc::clone(&self.rules.read())
    }

    /// Evaluate the rules in a rule set against a context.
    ///
    /// Disabled rules and rules outside `rule_set` are skipped. The first
    /// triggered block/close rule ends evaluation; alerts accumulate up to
    /// that point.
    #[must_use]
    pub fn evaluate(&self, rule_set: &str, ctx: &RiskContext) -> RiskDecision {
        let rules = self.rules();
        let mut decision = RiskDecision::default();

        for rule in rules.iter() {
            if !rule.enabled || rule.rule_set != rule_set {
                continue;
            }
            if !ctx.triggers(&rule.condition) {
                continue;
            }

            let triggered = TriggeredRule {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                action: rule.action,
            };
            match rule.action {
                RuleAction::Alert => {
                    warn!(rule = %rule.id, "risk alert");
                    decision.alerts.push(triggered);
                }
                RuleAction::BlockTrade | RuleAction::CloseTrade => {
                    warn!(rule = %rule.id, action = ?rule.action, "risk rule fired");
                    decision.blocking = Some(triggered);
                    break;
                }
            }
        }

        decision
    }
}
