//! Trade lifecycle orchestration.
//!
//! The orchestrator owns the trade record and drives it through the state
//! machine: validate, risk-check, gate on market data, submit, wait for the
//! fill (chasing the price if configured), attach exit brackets, and close.
//! Per-trade mutations are serialized through an async lock so a concurrent
//! cancel and a fill-poll transition cannot interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, EngineConfig, GateConfig};
use crate::domain::intent::{OrderKind, TradeIntent};
use crate::domain::shared::{BrokerOrderId, TradeId};
use crate::domain::state_machine::TradeState;
use crate::domain::trade::{Trade, TradeError};
use crate::error::EngineError;
use crate::execution::{
    BrokerError, BrokerPort, ExecutionError, ExecutionService, OrderStatus, ReplaceOrderRequest,
};
use crate::marketdata::{gate, MarketStateCache};
use crate::persistence::TradeStore;
use crate::registry::{OcoGroup, OrderRegistry};
use crate::risk::{RiskContext, RiskEngine, RuleAction, TriggeredRule};

/// Per-call overrides for [`Orchestrator::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Override the configured chase toggle for this trade.
    pub chase: Option<bool>,
    /// Whether to attach exit brackets after the fill.
    pub attach_brackets: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            chase: None,
            attach_brackets: true,
        }
    }
}

/// Result of driving a trade through its entry lifecycle.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    /// The trade this outcome belongs to.
    pub trade_id: TradeId,
    /// State the trade ended the call in.
    pub state: TradeState,
    /// Entry broker order id, once one exists.
    pub entry_order_id: Option<BrokerOrderId>,
    /// Realized entry price, when the entry filled.
    pub fill_price: Option<Decimal>,
    /// The bracket group, once attached.
    pub brackets: Option<OcoGroup>,
    /// Why the trade stopped short of `OCO_ATTACHED`, when it did.
    pub reason: Option<String>,
    /// Risk alert rules that fired during entry evaluation.
    pub alerts: Vec<TriggeredRule>,
}

impl ExecuteOutcome {
    /// Whether the entry completed without a trade-flow stop.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reason.is_none()
            && matches!(self.state, TradeState::Filled | TradeState::OcoAttached)
    }
}

/// One action taken by a risk sweep.
#[derive(Debug, Clone)]
pub struct RiskSweepAction {
    /// The trade that was closed.
    pub trade_id: TradeId,
    /// The rule that demanded it.
    pub rule: TriggeredRule,
}

enum FillWait {
    Filled(Decimal),
    Terminal(OrderStatus),
    Pending,
}

/// Drives trades through the lifecycle state machine.
pub struct Orchestrator<B, R, S> {
    execution: Arc<ExecutionService<B, R>>,
    store: Arc<S>,
    cache: Arc<MarketStateCache>,
    risk: Arc<RiskEngine>,
    engine: EngineConfig,
    gate: GateConfig,
    rule_set: String,
    locks: parking_lot::Mutex<HashMap<TradeId, Arc<Mutex<()>>>>,
}

impl<B, R, S> Orchestrator<B, R, S>
where
    B: BrokerPort,
    R: OrderRegistry,
    S: TradeStore,
{
    /// Assemble an orchestrator from its collaborators and configuration.
    pub fn new(
        execution: Arc<ExecutionService<B, R>>,
        store: Arc<S>,
        cache: Arc<MarketStateCache>,
        risk: Arc<RiskEngine>,
        config: &Config,
    ) -> Self {
        Self {
            execution,
            store,
            cache,
            risk,
            engine: config.engine.clone(),
            gate: config.gate.clone(),
            rule_set: config.risk.active_rule_set.clone(),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a trade record.
    pub async fn trade(&self, trade_id: &TradeId) -> Option<Trade> {
        self.store.get(trade_id).await
    }

    /// All trades in non-terminal states.
    pub async fn open_trades(&self) -> Vec<Trade> {
        self.store.open_trades().await
    }

    /// Drive a new intent through its entry lifecycle.
    ///
    /// Trade-flow stops (risk block, stale market data, broker rejection,
    /// an unfilled order left resting) are reported in the outcome, with
    /// the trade record persisted in the matching state. Errors are
    /// reserved for invalid intents and infrastructure failures.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if the intent fails validation, the registry
    /// refuses the submission key, or persistence fails.
    pub async fn execute(
        &self,
        intent: TradeIntent,
        options: ExecuteOptions,
    ) -> Result<ExecuteOutcome, EngineError> {
        intent.validate()?;

        let trade = Trade::new(intent);
        let trade_id = trade.id().clone();
        let intent = trade.intent().clone();
        self.store.save(&trade).await?;
        info!(trade_id = %trade_id, symbol = %intent.symbol, "trade accepted");

        // Risk rules run before any broker contact.
        let ctx = self.entry_context().await;
        let decision = self.risk.evaluate(&self.rule_set, &ctx);
        let alerts = decision.alerts;
        if let Some(rule) = decision.blocking {
            let reason = format!("risk rule '{}' blocked entry", rule.rule_name);
            let trade = self.reject(&trade_id, &reason).await?;
            return Ok(outcome_of(&trade, None, Some(reason), alerts));
        }

        // Market-data gate: freshness, then delta drift when a target is set.
        let snapshot = self.cache.snapshot(&intent.symbol);
        let gate_decision = gate::evaluate(
            snapshot.as_ref(),
            self.gate.max_staleness_ms,
            intent.target_delta_points,
            self.gate.delta_tolerance_points,
        );
        if let Some(reason) = gate_decision.reason() {
            let reason = reason.to_string();
            let trade = self.reject(&trade_id, &reason).await?;
            return Ok(outcome_of(&trade, None, Some(reason), alerts));
        }

        self.with_trade(&trade_id, |t| t.transition(TradeState::Submitted))
            .await?;

        let submit = match self.execution.submit_entry(&trade_id, &intent, None).await {
            Ok(submit) => submit,
            Err(ExecutionError::Broker(BrokerError::OrderRejected { reason })) => {
                let trade = self
                    .with_trade(&trade_id, |t| {
                        t.transition_with_error(TradeState::Rejected, reason.clone())
                    })
                    .await?;
                return Ok(outcome_of(&trade, None, Some(reason), alerts));
            }
            Err(err @ (ExecutionError::Broker(_)
            | ExecutionError::RetriesExhausted { .. }
            | ExecutionError::CorruptRecord { .. })) => {
                let message = err.to_string();
                let trade = self
                    .with_trade(&trade_id, |t| {
                        t.transition_with_error(TradeState::Error, message.clone())
                    })
                    .await?;
                return Ok(outcome_of(&trade, None, Some(message), alerts));
            }
            Err(err) => return Err(err.into()),
        };

        let order = submit.order;
        let entry_order_id = order.broker_order_id.clone();
        self.with_trade(&trade_id, |t| {
            t.set_entry_order_id(entry_order_id.clone());
            Ok(())
        })
        .await?;

        let fill = if order.status == OrderStatus::Filled {
            // Fast fill: the submit response already reports the fill. A
            // market-order ack may omit the price; the settled order
            // carries it.
            let price = match order.avg_fill_price.or(order.limit_price) {
                Some(price) => price,
                None => {
                    let settled = self
                        .execution
                        .get_order_status(&entry_order_id, &intent.account_id)
                        .await?;
                    settled
                        .avg_fill_price
                        .or(settled.limit_price)
                        .unwrap_or_default()
                }
            };
            FillWait::Filled(price)
        } else {
            self.with_trade(&trade_id, |t| t.transition(TradeState::Working))
                .await?;
            let chase = options.chase.unwrap_or(self.engine.chase.enabled)
                && order.is_limit
                && intent.order_kind == OrderKind::Limit;
            self.await_fill(&trade_id, &intent, &entry_order_id, order.limit_price, chase)
                .await?
        };

        match fill {
            FillWait::Filled(price) => {
                let trade = self
                    .transition_or_current(&trade_id, |t| t.transition(TradeState::Filled))
                    .await?;
                if trade.state() != TradeState::Filled {
                    // A concurrent cancel landed first; report the record
                    // as it stands.
                    let reason = "trade state changed while handling the fill".to_string();
                    return Ok(outcome_of(&trade, Some(entry_order_id), Some(reason), alerts));
                }
                info!(trade_id = %trade_id, price = %price, "entry filled");
                self.finish_filled(&trade_id, &intent, &entry_order_id, price, &options, alerts)
                    .await
            }
            FillWait::Terminal(OrderStatus::Rejected) => {
                let reason = "entry order rejected by broker".to_string();
                let trade = self
                    .transition_or_current(&trade_id, |t| {
                        // The state machine has no WORKING -> REJECTED edge;
                        // a rejection seen while working retires through
                        // ERROR instead.
                        let target = if t.state() == TradeState::Submitted {
                            TradeState::Rejected
                        } else {
                            TradeState::Error
                        };
                        t.transition_with_error(target, reason.clone())
                    })
                    .await?;
                Ok(outcome_of(&trade, Some(entry_order_id), Some(reason), alerts))
            }
            FillWait::Terminal(status) => {
                let reason = format!("entry order ended {status:?} before filling");
                let trade = self
                    .transition_or_current(&trade_id, |t| {
                        t.transition_with_note(TradeState::Cancelled, reason.clone())
                    })
                    .await?;
                Ok(outcome_of(&trade, Some(entry_order_id), Some(reason), alerts))
            }
            FillWait::Pending => {
                let reason = "entry unfilled; order left resting".to_string();
                warn!(trade_id = %trade_id, "{reason}");
                let trade = self
                    .store
                    .get(&trade_id)
                    .await
                    .ok_or_else(|| EngineError::TradeNotFound {
                        trade_id: trade_id.clone(),
                    })?;
                Ok(outcome_of(&trade, Some(entry_order_id), Some(reason), alerts))
            }
        }
    }

    /// Cancel a trade whose entry order is still live.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotCancelable` unless the trade is in
    /// `SUBMITTED` or `WORKING`, or an execution error if the broker
    /// refuses the cancel.
    pub async fn cancel_trade(&self, trade_id: &TradeId) -> Result<Trade, EngineError> {
        let lock = self.lock_for(trade_id);
        let _guard = lock.lock().await;

        let mut trade = self
            .store
            .get(trade_id)
            .await
            .ok_or_else(|| EngineError::TradeNotFound {
                trade_id: trade_id.clone(),
            })?;
        if !trade.state().is_cancelable() {
            return Err(EngineError::NotCancelable {
                trade_id: trade_id.clone(),
                state: trade.state(),
            });
        }

        if let Some(entry) = trade.entry_order_id().cloned() {
            let cancel = self
                .execution
                .cancel(&entry, &trade.intent().account_id)
                .await;
            if !cancel.success {
                // The order may have filled in the meantime; surface that
                // instead of forcing the state.
                let current = self
                    .execution
                    .get_order_status(&entry, &trade.intent().account_id)
                    .await?;
                if current.status == OrderStatus::Filled {
                    return Err(EngineError::NotCancelable {
                        trade_id: trade_id.clone(),
                        state: trade.state(),
                    });
                }
                return Err(EngineError::Execution(ExecutionError::Broker(
                    BrokerError::Unknown {
                        message: cancel.error.unwrap_or_else(|| "cancel failed".to_string()),
                    },
                )));
            }
        }

        trade.transition_with_note(TradeState::Cancelled, "cancelled by request")?;
        self.store.save(&trade).await?;
        info!(trade_id = %trade_id, "trade cancelled");
        Ok(trade)
    }

    /// Close an open position at market, cancelling its brackets first.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotCloseable` unless the trade is in `FILLED`
    /// or `OCO_ATTACHED`, or an execution error if the closing order is
    /// refused.
    pub async fn force_close(
        &self,
        trade_id: &TradeId,
        reason: &str,
    ) -> Result<Trade, EngineError> {
        let lock = self.lock_for(trade_id);
        let _guard = lock.lock().await;

        let mut trade = self
            .store
            .get(trade_id)
            .await
            .ok_or_else(|| EngineError::TradeNotFound {
                trade_id: trade_id.clone(),
            })?;
        if !matches!(trade.state(), TradeState::Filled | TradeState::OcoAttached) {
            return Err(EngineError::NotCloseable {
                trade_id: trade_id.clone(),
                state: trade.state(),
            });
        }

        let account = trade.intent().account_id.clone();
        for bracket in [trade.take_profit_order_id(), trade.stop_loss_order_id()]
            .into_iter()
            .flatten()
        {
            let cancel = self.execution.cancel(bracket, &account).await;
            if !cancel.success {
                // Already filled/cancelled brackets are fine to leave.
                warn!(trade_id = %trade_id, order_id = %bracket, "bracket cancel failed");
            }
        }

        let close = self
            .execution
            .submit_market_close(trade_id, trade.intent())
            .await?;
        trade.transition_with_note(
            TradeState::Closed,
            format!("force close ({reason}); order {}", close.broker_order_id),
        )?;
        self.store.save(&trade).await?;
        info!(trade_id = %trade_id, reason = %reason, "position force-closed");
        Ok(trade)
    }

    /// Evaluate close-type risk rules against every open position and act
    /// on the first match per trade.
    ///
    /// # Errors
    ///
    /// Returns the first persistence or execution failure; trades already
    /// handled keep their new state.
    pub async fn run_risk_checks(&self) -> Result<Vec<RiskSweepAction>, EngineError> {
        let open = self.store.open_trades().await;
        let open_count = open.len();
        let now = Utc::now();
        let mut actions = Vec::new();

        for trade in open {
            if !matches!(trade.state(), TradeState::Filled | TradeState::OcoAttached) {
                continue;
            }

            let snapshot = self.cache.snapshot(&trade.intent().symbol);
            let ctx = RiskContext {
                open_trades: open_count,
                short_delta_points: snapshot
                    .and_then(|s| s.greeks)
                    .map(|g| g.delta.abs() * Decimal::from(100)),
                now: Some(now),
                time_exit: trade.intent().exit_rules.time_exit,
                flags: std::collections::HashSet::new(),
            };

            let decision = self.risk.evaluate(&self.rule_set, &ctx);
            if let Some(rule) = decision.blocking {
                if rule.action == RuleAction::CloseTrade {
                    let reason = format!("risk rule '{}'", rule.rule_name);
                    self.force_close(trade.id(), &reason).await?;
                    actions.push(RiskSweepAction {
                        trade_id: trade.id().clone(),
                        rule,
                    });
                }
            }
        }

        Ok(actions)
    }

    /// Spawn the periodic risk sweep. Stops when the token is cancelled.
    pub fn spawn_risk_monitor(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()>
    where
        B: 'static,
        R: 'static,
        S: 'static,
    {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        if let Err(err) = self.run_risk_checks().await {
                            error!(error = %err, "risk sweep failed");
                        }
                    }
                }
            }
        })
    }

    async fn finish_filled(
        &self,
        trade_id: &TradeId,
        intent: &TradeIntent,
        entry_order_id: &BrokerOrderId,
        fill_price: Decimal,
        options: &ExecuteOptions,
        alerts: Vec<TriggeredRule>,
    ) -> Result<ExecuteOutcome, EngineError> {
        let bracket_eligible = options.attach_brackets
            && intent.is_complete_spread()
            && intent.exit_rules.take_profit_pct > Decimal::ZERO
            && intent.exit_rules.stop_loss_pct > Decimal::ZERO;

        if !bracket_eligible {
            let trade = self
                .store
                .get(trade_id)
                .await
                .ok_or_else(|| EngineError::TradeNotFound {
                    trade_id: trade_id.clone(),
                })?;
            let mut out = outcome_of(&trade, Some(entry_order_id.clone()), None, alerts);
            out.fill_price = Some(fill_price);
            return Ok(out);
        }

        match self
            .execution
            .attach_brackets(trade_id, intent, entry_order_id, fill_price)
            .await
        {
            Ok(group) => {
                let trade = self
                    .with_trade(trade_id, |t| {
                        if let (Some(tp), Some(sl)) = (
                            group.take_profit_order_id.clone(),
                            group.stop_loss_order_id.clone(),
                        ) {
                            t.set_bracket_order_ids(tp, sl);
                        }
                        t.transition(TradeState::OcoAttached)
                    })
                    .await?;
                let mut out = outcome_of(&trade, Some(entry_order_id.clone()), None, alerts);
                out.fill_price = Some(fill_price);
                out.brackets = Some(group);
                Ok(out)
            }
            Err(err) => {
                let message = format!("bracket attach failed: {err}");
                let trade = self
                    .with_trade(trade_id, |t| {
                        t.transition_with_error(TradeState::Error, message.clone())
                    })
                    .await?;
                let mut out = outcome_of(&trade, Some(entry_order_id.clone()), Some(message), alerts);
                out.fill_price = Some(fill_price);
                Ok(out)
            }
        }
    }

    /// Poll the entry order until it fills, ends, or the budget runs out,
    /// chasing the price between windows when enabled.
    async fn await_fill(
        &self,
        trade_id: &TradeId,
        intent: &TradeIntent,
        order_id: &BrokerOrderId,
        limit_price: Option<Decimal>,
        chase_enabled: bool,
    ) -> Result<FillWait, EngineError> {
        let account = &intent.account_id;
        let interval = Duration::from_millis(self.engine.fill_poll_interval_ms);
        let total = self.engine.fill_poll_attempts;

        if !chase_enabled {
            return self.poll_fill(order_id, account, total, interval).await;
        }

        let chase = self.engine.chase.clone();
        let window = u32::try_from(
            (chase.wait_ms / self.engine.fill_poll_interval_ms.max(1)).max(1),
        )
        .unwrap_or(1);
        let mut polls_used = 0u32;
        let mut price = limit_price.unwrap_or_default();

        for attempt in 1..=chase.max_attempts {
            let budget = window.min(total.saturating_sub(polls_used));
            if budget == 0 {
                break;
            }
            match self.poll_fill(order_id, account, budget, interval).await? {
                FillWait::Pending => {
                    polls_used += budget;
                    // Credit structures chase by conceding credit: each step
                    // lowers the limit toward the bid.
                    let new_price = price - chase.price_step;
                    if new_price <= Decimal::ZERO {
                        break;
                    }
                    let note = format!("chase {attempt}: {price} -> {new_price}");
                    let trade = self
                        .transition_or_current(trade_id, |t| {
                            t.transition_with_note(TradeState::Working, note.clone())
                        })
                        .await?;
                    if trade.state() != TradeState::Working {
                        // Concurrent cancel; the next poll reports the
                        // order's terminal status.
                        break;
                    }

                    match self
                        .execution
                        .replace(
                            order_id,
                            account,
                            &ReplaceOrderRequest {
                                price: Some(new_price),
                                quantity: None,
                            },
                        )
                        .await
                    {
                        Ok(replaced) => {
                            if replaced.status == OrderStatus::Filled {
                                return Ok(FillWait::Filled(
                                    replaced.avg_fill_price.unwrap_or(new_price),
                                ));
                            }
                            price = new_price;
                        }
                        Err(ExecutionError::Broker(err)) => {
                            // A replace race against the fill surfaces as a
                            // broker refusal; re-read the order to find out.
                            warn!(trade_id = %trade_id, error = %err, "chase replace refused");
                            let current = self.execution.get_order_status(order_id, account).await?;
                            match current.status {
                                OrderStatus::Filled => {
                                    return Ok(FillWait::Filled(
                                        current.avg_fill_price.unwrap_or(price),
                                    ));
                                }
                                status if status.is_terminal() => {
                                    return Ok(FillWait::Terminal(status));
                                }
                                _ => break,
                            }
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                other => return Ok(other),
            }
        }

        // Chase budget spent; keep polling with what remains, then leave
        // the order resting.
        let remaining = total.saturating_sub(polls_used);
        if remaining > 0 {
            return self.poll_fill(order_id, account, remaining, interval).await;
        }
        Ok(FillWait::Pending)
    }

    async fn poll_fill(
        &self,
        order_id: &BrokerOrderId,
        account: &crate::domain::shared::AccountId,
        attempts: u32,
        interval: Duration,
    ) -> Result<FillWait, EngineError> {
        for _ in 0..attempts {
            let current = self.execution.get_order_status(order_id, account).await?;
            match current.status {
                OrderStatus::Filled => {
                    return Ok(FillWait::Filled(
                        current
                            .avg_fill_price
                            .or(current.limit_price)
                            .unwrap_or_default(),
                    ));
                }
                status if status.is_terminal() => return Ok(FillWait::Terminal(status)),
                _ => tokio::time::sleep(interval).await,
            }
        }
        Ok(FillWait::Pending)
    }

    async fn reject(&self, trade_id: &TradeId, reason: &str) -> Result<Trade, EngineError> {
        warn!(trade_id = %trade_id, reason = %reason, "trade rejected before submission");
        self.with_trade(trade_id, |t| {
            t.transition_with_error(TradeState::Rejected, reason)
        })
        .await
    }

    /// Apply a transition, or return the current record when a concurrent
    /// mutation (e.g. a cancel) made the transition invalid.
    async fn transition_or_current<F>(&self, trade_id: &TradeId, f: F) -> Result<Trade, EngineError>
    where
        F: FnOnce(&mut Trade) -> Result<(), TradeError>,
    {
        match self.with_trade(trade_id, f).await {
            Ok(trade) => Ok(trade),
            Err(EngineError::Trade(_)) => {
                self.store
                    .get(trade_id)
                    .await
                    .ok_or_else(|| EngineError::TradeNotFound {
                        trade_id: trade_id.clone(),
                    })
            }
            Err(err) => Err(err),
        }
    }

    async fn with_trade<F>(&self, trade_id: &TradeId, f: F) -> Result<Trade, EngineError>
    where
        F: FnOnce(&mut Trade) -> Result<(), TradeError>,
    {
        let lock = self.lock_for(trade_id);
        let _guard = lock.lock().await;

        let mut trade = self
            .store
            .get(trade_id)
            .await
            .ok_or_else(|| EngineError::TradeNotFound {
                trade_id: trade_id.clone(),
            })?;
        f(&mut trade)?;
        self.store.save(&trade).await?;
        Ok(trade)
    }

    fn lock_for(&self, trade_id: &TradeId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(trade_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn entry_context(&self) -> RiskContext {
        // The just-created pending trade is excluded from its own count.
        let open = self.store.open_trade_count().await;
        RiskContext {
            open_trades: open.saturating_sub(1),
            now: Some(Utc::now()),
            ..Default::default()
        }
    }
}

fn outcome_of(
    trade: &Trade,
    entry_order_id: Option<BrokerOrderId>,
    reason: Option<String>,
    alerts: Vec<TriggeredRule>,
) -> ExecuteOutcome {
    ExecuteOutcome {
        trade_id: trade.id().clone(),
        state: trade.state(),
        entry_order_id: entry_order_id.or_else(|| trade.entry_order_id().cloned()),
        fill_price: None,
        brackets: None,
        reason,
        alerts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChaseConfig;
    use crate::domain::intent::{
        ExitRules, LegAction, OptionLeg, OptionRight, Provenance,
    };
    use crate::domain::shared::{AccountId, Symbol};
    use crate::execution::{PaperBroker, Position, RawBrokerOrder, SubmitOrderRequest};
    use crate::marketdata::{Greeks, QuoteEvent};
    use crate::persistence::InMemoryTradeStore;
    use crate::registry::InMemoryOrderRegistry;
    use crate::risk::{RiskRule, RuleCondition};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    struct Harness {
        broker: Arc<PaperBroker>,
        cache: Arc<MarketStateCache>,
        orchestrator: Arc<Orchestrator<PaperBroker, InMemoryOrderRegistry, InMemoryTradeStore>>,
    }

    fn harness(broker: PaperBroker, rules: Vec<RiskRule>) -> Harness {
        let broker = Arc::new(broker);
        let registry = Arc::new(InMemoryOrderRegistry::new());
        let execution = Arc::new(ExecutionService::new(Arc::clone(&broker), registry));
        let store = Arc::new(InMemoryTradeStore::new());
        let cache = Arc::new(MarketStateCache::new(500));
        let risk = Arc::new(RiskEngine::with_rules(rules));

        let mut config = Config::default();
        config.engine.fill_poll_interval_ms = 1;
        config.engine.fill_poll_attempts = 50;
        config.engine.chase = ChaseConfig {
            enabled: false,
            max_attempts: 3,
            price_step: dec!(0.05),
            wait_ms: 2,
        };

        let orchestrator = Arc::new(Orchestrator::new(
            execution,
            store,
            Arc::clone(&cache),
            risk,
            &config,
        ));
        Harness {
            broker,
            cache,
            orchestrator,
        }
    }

    fn intent() -> TradeIntent {
        let expiry = NaiveDate::from_ymd_opt(2026, 9, 18).unwrap();
        TradeIntent {
            symbol: Symbol::new("SPY"),
            legs: vec![
                OptionLeg {
                    action: LegAction::Sell,
                    right: OptionRight::Put,
                    strike: dec!(500),
                    expiry,
                    quantity: 1,
                },
                OptionLeg {
                    action: LegAction::Buy,
                    right: OptionRight::Put,
                    strike: dec!(495),
                    expiry,
                    quantity: 1,
                },
            ],
            quantity: 1,
            order_kind: OrderKind::Limit,
            limit_price: Some(dec!(2.00)),
            exit_rules: ExitRules {
                take_profit_pct: dec!(50),
                stop_loss_pct: dec!(100),
                time_exit: None,
            },
            target_delta_points: Some(dec!(30)),
            account_id: AccountId::new("acct-1"),
            provenance: Provenance::Webhook,
            strategy: Some("put-credit-spread".to_string()),
            strategy_version: None,
        }
    }

    fn fresh_quote(cache: &MarketStateCache) {
        cache.apply_quote(&QuoteEvent {
            symbol: Symbol::new("SPY"),
            bid: dec!(1.95),
            ask: dec!(2.05),
            mark: dec!(2.00),
            greeks: Some(Greeks {
                delta: dec!(-0.30),
                gamma: dec!(0.02),
                theta: dec!(-0.05),
                vega: dec!(0.10),
            }),
        });
    }

    #[tokio::test]
    async fn happy_path_reaches_oco_attached() {
        let h = harness(PaperBroker::filling_immediately(), vec![]);
        fresh_quote(&h.cache);

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, TradeState::OcoAttached);
        assert_eq!(outcome.fill_price, Some(dec!(2.00)));
        assert!(outcome.is_success());
        let group = outcome.brackets.as_ref().unwrap();
        assert!(group.take_profit_order_id.is_some());
        assert!(group.stop_loss_order_id.is_some());
        // Entry plus two bracket orders.
        assert_eq!(h.broker.order_count(), 3);

        let trade = h.orchestrator.trade(&outcome.trade_id).await.unwrap();
        assert!(trade.take_profit_order_id().is_some());
        assert!(trade.stop_loss_order_id().is_some());
        let states: Vec<_> = trade.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                TradeState::Submitted,
                TradeState::Filled,
                TradeState::OcoAttached
            ]
        );
    }

    #[tokio::test]
    async fn missing_market_data_rejects_before_broker() {
        let h = harness(PaperBroker::filling_immediately(), vec![]);
        // No quote applied.

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, TradeState::Rejected);
        assert!(outcome.reason.unwrap().contains("no market data"));
        assert_eq!(h.broker.order_count(), 0);
    }

    #[tokio::test]
    async fn delta_drift_rejects_before_broker() {
        let h = harness(PaperBroker::filling_immediately(), vec![]);
        h.cache.apply_quote(&QuoteEvent {
            symbol: Symbol::new("SPY"),
            bid: dec!(1.95),
            ask: dec!(2.05),
            mark: dec!(2.00),
            greeks: Some(Greeks {
                delta: dec!(-0.45),
                gamma: dec!(0.02),
                theta: dec!(-0.05),
                vega: dec!(0.10),
            }),
        });

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, TradeState::Rejected);
        assert!(outcome.reason.unwrap().contains("drifted"));
        assert_eq!(h.broker.order_count(), 0);
    }

    #[tokio::test]
    async fn risk_rule_blocks_entry() {
        let h = harness(
            PaperBroker::filling_immediately(),
            vec![RiskRule {
                id: "no-entries".to_string(),
                name: "no entries".to_string(),
                rule_set: "default".to_string(),
                priority: 1,
                condition: RuleCondition::PortfolioLimit { max_open_trades: 0 },
                action: RuleAction::BlockTrade,
                enabled: true,
            }],
        );
        fresh_quote(&h.cache);

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, TradeState::Rejected);
        assert!(outcome.reason.unwrap().contains("no entries"));
        assert_eq!(h.broker.order_count(), 0);
    }

    #[tokio::test]
    async fn unfilled_order_left_resting() {
        let h = harness(PaperBroker::new(), vec![]);
        fresh_quote(&h.cache);

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, TradeState::Working);
        assert!(!outcome.is_success());
        assert!(outcome.brackets.is_none());
        assert!(outcome.reason.unwrap().contains("resting"));
        assert_eq!(h.broker.order_count(), 1);
    }

    #[tokio::test]
    async fn fill_during_polling_attaches_brackets() {
        let h = harness(PaperBroker::new(), vec![]);
        fresh_quote(&h.cache);

        let broker = Arc::clone(&h.broker);
        let filler = tokio::spawn(async move {
            // Wait for the entry order to appear, then fill it.
            loop {
                if broker.order_count() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert!(broker.fill_order(&BrokerOrderId::new("paper-1"), dec!(2.10)));
        });

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();
        filler.await.unwrap();

        assert_eq!(outcome.state, TradeState::OcoAttached);
        // Brackets key off the realized 2.10, not the 2.00 signal.
        assert_eq!(outcome.fill_price, Some(dec!(2.10)));
    }

    #[tokio::test]
    async fn rejection_while_working_retires_the_trade() {
        let h = harness(PaperBroker::new(), vec![]);
        fresh_quote(&h.cache);

        let broker = Arc::clone(&h.broker);
        let rejecter = tokio::spawn(async move {
            loop {
                if broker.order_count() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert!(broker.reject_order(&BrokerOrderId::new("paper-1")));
        });

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();
        rejecter.await.unwrap();

        assert_eq!(outcome.state, TradeState::Error);
        assert!(!outcome.is_success());
        assert!(outcome.reason.unwrap().contains("rejected"));

        // The trade must end terminal with the rejection on its history.
        let trade = h.orchestrator.trade(&outcome.trade_id).await.unwrap();
        assert!(trade.state().is_terminal());
        assert!(trade.transitions().last().unwrap().error.is_some());
        let open = h.orchestrator.open_trades().await;
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn priceless_fill_ack_resolves_price_from_order_status() {
        // Acks the submit as filled without a price; the settled order
        // carries the fill price.
        struct QuietFillBroker;

        #[async_trait::async_trait]
        impl BrokerPort for QuietFillBroker {
            async fn submit_order(
                &self,
                _request: &SubmitOrderRequest,
            ) -> Result<RawBrokerOrder, BrokerError> {
                Ok(RawBrokerOrder {
                    id: Some("bo-1".to_string()),
                    status: "filled".to_string(),
                    ..Default::default()
                })
            }
            async fn cancel_order(
                &self,
                _order_id: &BrokerOrderId,
                _account_id: &AccountId,
            ) -> Result<(), BrokerError> {
                Ok(())
            }
            async fn replace_order(
                &self,
                _order_id: &BrokerOrderId,
                _account_id: &AccountId,
                _changes: &ReplaceOrderRequest,
            ) -> Result<RawBrokerOrder, BrokerError> {
                unreachable!()
            }
            async fn get_order(
                &self,
                order_id: &BrokerOrderId,
                _account_id: &AccountId,
            ) -> Result<RawBrokerOrder, BrokerError> {
                Ok(RawBrokerOrder {
                    id: Some(order_id.as_str().to_string()),
                    status: "filled".to_string(),
                    avg_fill_price: Some(dec!(2.07)),
                    ..Default::default()
                })
            }
            async fn get_positions(
                &self,
                _account_id: &AccountId,
            ) -> Result<Vec<Position>, BrokerError> {
                Ok(Vec::new())
            }
        }

        let registry = Arc::new(InMemoryOrderRegistry::new());
        let execution = Arc::new(ExecutionService::new(Arc::new(QuietFillBroker), registry));
        let store = Arc::new(InMemoryTradeStore::new());
        let cache = Arc::new(MarketStateCache::new(500));
        let risk = Arc::new(RiskEngine::with_rules(vec![]));
        let mut config = Config::default();
        config.engine.fill_poll_interval_ms = 1;
        let orchestrator = Orchestrator::new(execution, store, Arc::clone(&cache), risk, &config);
        fresh_quote(&cache);

        let mut market = intent();
        market.order_kind = OrderKind::Market;
        market.limit_price = None;

        let outcome = orchestrator
            .execute(
                market,
                ExecuteOptions {
                    chase: None,
                    attach_brackets: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.state, TradeState::Filled);
        assert_eq!(outcome.fill_price, Some(dec!(2.07)));
    }

    #[tokio::test]
    async fn no_brackets_when_disabled() {
        let h = harness(PaperBroker::filling_immediately(), vec![]);
        fresh_quote(&h.cache);

        let outcome = h
            .orchestrator
            .execute(
                intent(),
                ExecuteOptions {
                    chase: None,
                    attach_brackets: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.state, TradeState::Filled);
        assert_eq!(h.broker.order_count(), 1);
    }

    #[tokio::test]
    async fn cancel_working_trade() {
        let h = harness(PaperBroker::new(), vec![]);
        fresh_quote(&h.cache);

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.state, TradeState::Working);

        let trade = h.orchestrator.cancel_trade(&outcome.trade_id).await.unwrap();
        assert_eq!(trade.state(), TradeState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_closed_trade_refused() {
        let h = harness(PaperBroker::filling_immediately(), vec![]);
        fresh_quote(&h.cache);

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.state, TradeState::OcoAttached);

        let result = h.orchestrator.cancel_trade(&outcome.trade_id).await;
        assert!(matches!(result, Err(EngineError::NotCancelable { .. })));
    }

    #[tokio::test]
    async fn force_close_cancels_brackets_and_closes() {
        let h = harness(PaperBroker::filling_immediately(), vec![]);
        fresh_quote(&h.cache);

        let outcome = h
            .orchestrator
            .execute(intent(), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.state, TradeState::OcoAttached);

        let trade = h
            .orchestrator
            .force_close(&outcome.trade_id, "manual")
            .await
            .unwrap();
        assert_eq!(trade.state(), TradeState::Closed);
        // Entry + two brackets + the closing order.
        assert_eq!(h.broker.order_count(), 4);
    }

    #[tokio::test]
    async fn risk_sweep_force_closes_on_time_exit() {
        let h = harness(
            PaperBroker::filling_immediately(),
            vec![RiskRule {
                id: "time-exit".to_string(),
                name: "time exit".to_string(),
                rule_set: "default".to_string(),
                priority: 1,
                condition: RuleCondition::TimeExit,
                action: RuleAction::CloseTrade,
                enabled: true,
            }],
        );
        fresh_quote(&h.cache);

        let mut intent = intent();
        intent.exit_rules.time_exit = Some(Utc::now() - chrono::Duration::minutes(1));
        let outcome = h
            .orchestrator
            .execute(intent, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.state, TradeState::OcoAttached);

        let actions = h.orchestrator.run_risk_checks().await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].rule.rule_id, "time-exit");

        let trade = h.orchestrator.trade(&outcome.trade_id).await.unwrap();
        assert_eq!(trade.state(), TradeState::Closed);
    }

    #[tokio::test]
    async fn invalid_intent_is_an_error() {
        let h = harness(PaperBroker::filling_immediately(), vec![]);
        let mut bad = intent();
        bad.quantity = 0;

        let result = h.orchestrator.execute(bad, ExecuteOptions::default()).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
