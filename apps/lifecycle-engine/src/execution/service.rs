//! Execution service - idempotent order submission and bracket attachment.
//!
//! Every broker mutation funnels through this service so the idempotency
//! registry sees all of them. The at-most-once guarantee is per client
//! order id: a replayed submit with a confirmed key never reaches the
//! broker, it resolves to a status fetch instead.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::intent::{OptionLeg, TradeIntent};
use crate::domain::shared::{AccountId, BrokerOrderId, ClientOrderId, TradeId};
use crate::registry::{OcoGroup, OrderRegistry, RegistryError, SubmissionStatus};

use super::bracket::{derive_bracket_prices, BracketError, BracketPrices};
use super::broker::{
    normalize_order, AppOrder, BrokerError, BrokerOrderType, BrokerPort, ReplaceOrderRequest,
    SubmitOrderRequest,
};
use super::retry::{Backoff, RetryPolicy};

/// Execution-layer error.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Registry invariant violated.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Bracket derivation failed.
    #[error(transparent)]
    Bracket(#[from] BracketError),

    /// Transient broker failures exhausted the retry budget.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The final broker error.
        last_error: String,
    },

    /// A confirmed record exists but carries no broker order id.
    #[error("confirmed record for {key} has no broker order id")]
    CorruptRecord {
        /// The affected key.
        key: ClientOrderId,
    },
}

/// Result of a submit call.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Normalized broker order.
    pub order: AppOrder,
    /// Key the submission ran under.
    pub client_order_id: ClientOrderId,
    /// True when the call resolved from the registry without a new broker
    /// submission.
    pub replayed: bool,
}

/// Result of a cancel call. Cancel never propagates an error; the caller
/// inspects the outcome and decides.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// Whether the broker accepted the cancel.
    pub success: bool,
    /// Broker error message when it did not.
    pub error: Option<String>,
}

/// Idempotent execution facade over a broker port and an order registry.
pub struct ExecutionService<B, R> {
    broker: Arc<B>,
    registry: Arc<R>,
    retry_policy: RetryPolicy,
}

impl<B, R> ExecutionService<B, R>
where
    B: BrokerPort,
    R: OrderRegistry,
{
    /// Create a service with the default retry policy.
    pub fn new(broker: Arc<B>, registry: Arc<R>) -> Self {
        Self::with_retry_policy(broker, registry, RetryPolicy::default())
    }

    /// Create a service with an explicit retry policy.
    pub fn with_retry_policy(broker: Arc<B>, registry: Arc<R>, retry_policy: RetryPolicy) -> Self {
        Self {
            broker,
            registry,
            retry_policy,
        }
    }

    /// The registry behind this service.
    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Submit the entry order for an intent.
    ///
    /// When `client_order_id` is `None` a fresh key is generated. Passing
    /// the same key again replays: a confirmed key resolves to a broker
    /// status fetch, a failed or stuck key is superseded by a retry with a
    /// higher retry count.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError` on registry conflicts (key owned by another
    /// trade), broker rejection, or retry exhaustion.
    pub async fn submit_entry(
        &self,
        trade_id: &TradeId,
        intent: &TradeIntent,
        client_order_id: Option<ClientOrderId>,
    ) -> Result<SubmitOutcome, ExecutionError> {
        let key = client_order_id.unwrap_or_else(|| self.registry.generate_client_order_id());

        let retry_count = match self.registry.get_order(&key).await {
            // A key is bound to its trade for life; another trade must not
            // replay, supersede, or retry it.
            Some(record) if record.trade_id != *trade_id => {
                return Err(RegistryError::KeyOwnedByOtherTrade {
                    key: key.clone(),
                    owner: record.trade_id,
                }
                .into());
            }
            Some(record) if record.status == SubmissionStatus::Confirmed => {
                // Replay: the order already exists broker-side.
                let broker_order_id = record
                    .broker_order_id
                    .ok_or_else(|| ExecutionError::CorruptRecord { key: key.clone() })?;
                info!(
                    trade_id = %trade_id,
                    client_order_id = %key,
                    broker_order_id = %broker_order_id,
                    "submit replayed from registry"
                );
                let order = self
                    .get_order_status(&broker_order_id, &intent.account_id)
                    .await?;
                return Ok(SubmitOutcome {
                    order,
                    client_order_id: key,
                    replayed: true,
                });
            }
            Some(record) if record.status == SubmissionStatus::Submitted => {
                // A previous attempt died between record and confirm. Its
                // outcome is unknown; fail it explicitly before retrying
                // under the same key.
                warn!(
                    trade_id = %trade_id,
                    client_order_id = %key,
                    "superseding stuck in-flight submission"
                );
                self.registry
                    .mark_failed(&key, "superseded by resubmission")
                    .await?;
                record.retry_count + 1
            }
            Some(record) => record.retry_count + 1,
            None => 0,
        };

        let request = build_entry_request(&key, intent);
        let order = self
            .submit_with_retries(trade_id, &key, retry_count, &request, intent)
            .await?;

        Ok(SubmitOutcome {
            order,
            client_order_id: key,
            replayed: false,
        })
    }

    /// Cancel an order, reporting the result rather than erroring.
    pub async fn cancel(&self, order_id: &BrokerOrderId, account_id: &AccountId) -> CancelOutcome {
        match self.broker.cancel_order(order_id, account_id).await {
            Ok(()) => {
                info!(broker_order_id = %order_id, "order cancelled");
                CancelOutcome {
                    success: true,
                    error: None,
                }
            }
            Err(err) => {
                warn!(broker_order_id = %order_id, error = %err, "cancel failed");
                CancelOutcome {
                    success: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Replace price/quantity on a resting order.
    ///
    /// # Errors
    ///
    /// Returns the broker error unchanged; replaces are not retried since a
    /// replace against a filled order must surface, not be repeated.
    pub async fn replace(
        &self,
        order_id: &BrokerOrderId,
        account_id: &AccountId,
        changes: &ReplaceOrderRequest,
    ) -> Result<AppOrder, ExecutionError> {
        let raw = self.broker.replace_order(order_id, account_id, changes).await?;
        let order = normalize_order(&raw)?;
        info!(
            broker_order_id = %order_id,
            price = ?changes.price,
            status = ?order.status,
            "order replaced"
        );
        Ok(order)
    }

    /// Fetch and normalize the current state of an order.
    ///
    /// # Errors
    ///
    /// Returns the broker error, or a normalization error for a malformed
    /// response.
    pub async fn get_order_status(
        &self,
        order_id: &BrokerOrderId,
        account_id: &AccountId,
    ) -> Result<AppOrder, ExecutionError> {
        let raw = self.broker.get_order(order_id, account_id).await?;
        Ok(normalize_order(&raw)?)
    }

    /// Attach an OCO bracket pair to a filled entry order.
    ///
    /// Bracket prices derive from `entry_price`, the realized fill. The
    /// call is idempotent per entry order: an existing complete group is
    /// returned as-is, a partially placed group resumes from where it
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError` if the legs do not form a complete spread,
    /// a percentage or the entry price is invalid, or a bracket submission
    /// fails.
    pub async fn attach_brackets(
        &self,
        trade_id: &TradeId,
        intent: &TradeIntent,
        entry_order_id: &BrokerOrderId,
        entry_price: Decimal,
    ) -> Result<OcoGroup, ExecutionError> {
        let prices = derive_bracket_prices(
            &intent.legs,
            entry_price,
            intent.exit_rules.take_profit_pct,
            intent.exit_rules.stop_loss_pct,
        )?;

        let mut group = match self.registry.get_oco_group(entry_order_id).await {
            Some(existing) => {
                if existing.take_profit_order_id.is_some() && existing.stop_loss_order_id.is_some()
                {
                    info!(
                        trade_id = %trade_id,
                        entry_order_id = %entry_order_id,
                        "bracket group already attached"
                    );
                    return Ok(existing);
                }
                existing
            }
            None => {
                let now = chrono::Utc::now();
                let group = OcoGroup {
                    entry_order_id: entry_order_id.clone(),
                    account_id: intent.account_id.clone(),
                    take_profit_pct: intent.exit_rules.take_profit_pct,
                    stop_loss_pct: intent.exit_rules.stop_loss_pct,
                    entry_price,
                    legs: intent.legs.clone(),
                    take_profit_order_id: None,
                    stop_loss_order_id: None,
                    created_at: now,
                    updated_at: now,
                };
                self.registry.store_oco_group(group.clone()).await?;
                group
            }
        };

        let closing_legs = closing_legs(&intent.legs);

        if group.take_profit_order_id.is_none() {
            let order = self
                .submit_bracket_leg(
                    trade_id,
                    intent,
                    &closing_legs,
                    BrokerOrderType::Limit,
                    Some(prices.take_profit),
                    None,
                    None,
                )
                .await?;
            group.take_profit_order_id = Some(order.broker_order_id);
            group.updated_at = chrono::Utc::now();
            self.registry.update_oco_group(group.clone()).await?;
        }

        if group.stop_loss_order_id.is_none() {
            let order = self
                .submit_bracket_leg(
                    trade_id,
                    intent,
                    &closing_legs,
                    BrokerOrderType::StopLimit,
                    Some(prices.stop_loss),
                    Some(prices.stop_loss),
                    group.take_profit_order_id.clone(),
                )
                .await?;
            group.stop_loss_order_id = Some(order.broker_order_id);
            group.updated_at = chrono::Utc::now();
            self.registry.update_oco_group(group.clone()).await?;
        }

        info!(
            trade_id = %trade_id,
            entry_order_id = %entry_order_id,
            take_profit = %prices.take_profit,
            stop_loss = %prices.stop_loss,
            "bracket group attached"
        );
        Ok(group)
    }

    /// Bracket prices that would be derived for an intent at an entry
    /// price, without side effects.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`derive_bracket_prices`].
    pub fn preview_bracket_prices(
        &self,
        intent: &TradeIntent,
        entry_price: Decimal,
    ) -> Result<BracketPrices, ExecutionError> {
        Ok(derive_bracket_prices(
            &intent.legs,
            entry_price,
            intent.exit_rules.take_profit_pct,
            intent.exit_rules.stop_loss_pct,
        )?)
    }

    /// Submit a marketable closing order for the whole structure, each leg
    /// flipped to its opposite action.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError` on broker rejection or retry exhaustion.
    pub async fn submit_market_close(
        &self,
        trade_id: &TradeId,
        intent: &TradeIntent,
    ) -> Result<AppOrder, ExecutionError> {
        let legs = closing_legs(&intent.legs);
        self.submit_bracket_leg(
            trade_id,
            intent,
            &legs,
            BrokerOrderType::Market,
            None,
            None,
            None,
        )
        .await
    }

    async fn submit_bracket_leg(
        &self,
        trade_id: &TradeId,
        intent: &TradeIntent,
        legs: &[OptionLeg],
        order_type: BrokerOrderType,
        limit_price: Option<Decimal>,
        stop_price: Option<Decimal>,
        oco_partner: Option<BrokerOrderId>,
    ) -> Result<AppOrder, ExecutionError> {
        let key = self.registry.generate_client_order_id();
        let request = SubmitOrderRequest {
            client_order_id: key.clone(),
            account_id: intent.account_id.clone(),
            symbol: intent.symbol.clone(),
            legs: legs.to_vec(),
            quantity: intent.quantity,
            order_type,
            limit_price,
            stop_price,
            oco_partner,
        };
        self.submit_with_retries(trade_id, &key, 0, &request, intent)
            .await
    }

    /// Submit under an idempotency key, retrying transient failures with
    /// the same key.
    async fn submit_with_retries(
        &self,
        trade_id: &TradeId,
        key: &ClientOrderId,
        initial_retry_count: u32,
        request: &SubmitOrderRequest,
        intent: &TradeIntent,
    ) -> Result<AppOrder, ExecutionError> {
        let metadata = serde_json::json!({
            "symbol": intent.symbol.as_str(),
            "account_id": intent.account_id.as_str(),
            "quantity": intent.quantity,
        });

        let mut backoff = Backoff::new(&self.retry_policy);
        let mut retry_count = initial_retry_count;

        loop {
            self.registry
                .record_submission(key, trade_id, retry_count, metadata.clone())
                .await?;

            match self.broker.submit_order(request).await {
                Ok(raw) => {
                    let order = normalize_order(&raw)?;
                    self.registry
                        .confirm_submission(key, &order.broker_order_id)
                        .await?;
                    info!(
                        trade_id = %trade_id,
                        client_order_id = %key,
                        broker_order_id = %order.broker_order_id,
                        status = ?order.status,
                        "order submitted"
                    );
                    return Ok(order);
                }
                Err(err) if err.is_transient() => {
                    self.registry.mark_failed(key, &err.to_string()).await?;
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(
                                trade_id = %trade_id,
                                client_order_id = %key,
                                error = %err,
                                delay_ms = delay.as_millis() as u64,
                                "transient broker failure, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            retry_count += 1;
                        }
                        None => {
                            return Err(ExecutionError::RetriesExhausted {
                                attempts: backoff.attempts(),
                                last_error: err.to_string(),
                            });
                        }
                    }
                }
                Err(err) => {
                    self.registry.mark_failed(key, &err.to_string()).await?;
                    warn!(
                        trade_id = %trade_id,
                        client_order_id = %key,
                        error = %err,
                        "order submission failed"
                    );
                    return Err(err.into());
                }
            }
        }
    }
}

/// Build the broker request for an entry submission.
fn build_entry_request(key: &ClientOrderId, intent: &TradeIntent) -> SubmitOrderRequest {
    let order_type = match intent.order_kind {
        crate::domain::intent::OrderKind::Limit => BrokerOrderType::Limit,
        crate::domain::intent::OrderKind::Market => BrokerOrderType::Market,
    };
    SubmitOrderRequest {
        client_order_id: key.clone(),
        account_id: intent.account_id.clone(),
        symbol: intent.symbol.clone(),
        legs: intent.legs.clone(),
        quantity: intent.quantity,
        order_type,
        limit_price: intent.limit_price,
        stop_price: None,
        oco_partner: None,
    }
}

/// Closing legs for a structure: each leg flipped to the opposite action.
fn closing_legs(legs: &[OptionLeg]) -> Vec<OptionLeg> {
    legs.iter()
        .map(|leg| OptionLeg {
            action: leg.action.opposite(),
            ..leg.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::intent::{ExitRules, LegAction as Action, OptionRight, OrderKind, Provenance};
    use crate::domain::shared::Symbol;
    use crate::execution::broker::{Position, RawBrokerOrder};
    use crate::registry::InMemoryOrderRegistry;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Scripted broker: pops one response per submit, records requests.
    struct ScriptedBroker {
        submit_responses: Mutex<Vec<Result<RawBrokerOrder, BrokerError>>>,
        submits: Mutex<Vec<SubmitOrderRequest>>,
        order_status: Mutex<String>,
        next_id: AtomicU64,
    }

    impl ScriptedBroker {
        fn new() -> Self {
            Self {
                submit_responses: Mutex::new(Vec::new()),
                submits: Mutex::new(Vec::new()),
                order_status: Mutex::new("working".to_string()),
                next_id: AtomicU64::new(1),
            }
        }

        fn push_ok(&self, status: &str) {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.submit_responses.lock().push(Ok(RawBrokerOrder {
                id: Some(format!("bo-{id}")),
                status: status.to_string(),
                quantity: Some(dec!(1)),
                ..Default::default()
            }));
        }

        fn push_err(&self, err: BrokerError) {
            self.submit_responses.lock().push(Err(err));
        }

        fn submit_count(&self) -> usize {
            self.submits.lock().len()
        }
    }

    #[async_trait::async_trait]
    impl BrokerPort for ScriptedBroker {
        async fn submit_order(
            &self,
            request: &SubmitOrderRequest,
        ) -> Result<RawBrokerOrder, BrokerError> {
            self.submits.lock().push(request.clone());
            let mut responses = self.submit_responses.lock();
            if responses.is_empty() {
                return Err(BrokerError::Unknown {
                    message: "script exhausted".to_string(),
                });
            }
            responses.remove(0)
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
            order_id: &BrokerOrderId,
            _account_id: &AccountId,
            changes: &ReplaceOrderRequest,
        ) -> Result<RawBrokerOrder, BrokerError> {
            Ok(RawBrokerOrder {
                id: Some(order_id.as_str().to_string()),
                status: "working".to_string(),
                limit_price: changes.price,
                ..Default::default()
            })
        }

        async fn get_order(
            &self,
            order_id: &BrokerOrderId,
            _account_id: &AccountId,
        ) -> Result<RawBrokerOrder, BrokerError> {
            Ok(RawBrokerOrder {
                id: Some(order_id.as_str().to_string()),
                status: self.order_status.lock().clone(),
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

    fn intent() -> TradeIntent {
        let expiry = NaiveDate::from_ymd_opt(2026, 9, 18).unwrap();
        TradeIntent {
            symbol: Symbol::new("SPY"),
            legs: vec![
                OptionLeg {
                    action: Action::Sell,
                    right: OptionRight::Put,
                    strike: dec!(500),
                    expiry,
                    quantity: 1,
                },
                OptionLeg {
                    action: Action::Buy,
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
            strategy: None,
            strategy_version: None,
        }
    }

    fn service(broker: Arc<ScriptedBroker>) -> ExecutionService<ScriptedBroker, InMemoryOrderRegistry> {
        ExecutionService::with_retry_policy(
            broker,
            Arc::new(InMemoryOrderRegistry::new()),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: std::time::Duration::from_millis(1),
                jitter: 0.0,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn submit_confirms_registry_record() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.push_ok("working");
        let svc = service(Arc::clone(&broker));
        let trade = TradeId::new("trade-1");

        let outcome = svc.submit_entry(&trade, &intent(), None).await.unwrap();
        assert!(!outcome.replayed);
        assert_eq!(broker.submit_count(), 1);

        let record = svc.registry().get_order(&outcome.client_order_id).await.unwrap();
        assert_eq!(record.status, SubmissionStatus::Confirmed);
        assert_eq!(
            record.broker_order_id.unwrap(),
            outcome.order.broker_order_id
        );
    }

    #[tokio::test]
    async fn replayed_submit_never_reaches_broker() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.push_ok("working");
        let svc = service(Arc::clone(&broker));
        let trade = TradeId::new("trade-1");

        let first = svc.submit_entry(&trade, &intent(), None).await.unwrap();
        let replay = svc
            .submit_entry(&trade, &intent(), Some(first.client_order_id.clone()))
            .await
            .unwrap();

        assert!(replay.replayed);
        assert_eq!(replay.order.broker_order_id, first.order.broker_order_id);
        // The second call was a status fetch, not a submission.
        assert_eq!(broker.submit_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retried_under_same_key() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.push_err(BrokerError::Timeout);
        broker.push_ok("working");
        let svc = service(Arc::clone(&broker));
        let trade = TradeId::new("trade-1");

        let outcome = svc.submit_entry(&trade, &intent(), None).await.unwrap();
        assert_eq!(broker.submit_count(), 2);

        let submits = broker.submits.lock();
        assert_eq!(submits[0].client_order_id, submits[1].client_order_id);
        drop(submits);

        let record = svc.registry().get_order(&outcome.client_order_id).await.unwrap();
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn rejection_marks_record_failed() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.push_err(BrokerError::OrderRejected {
            reason: "insufficient margin".to_string(),
        });
        let svc = service(Arc::clone(&broker));
        let trade = TradeId::new("trade-1");

        let key = ClientOrderId::new("key-1");
        let result = svc
            .submit_entry(&trade, &intent(), Some(key.clone()))
            .await;
        assert!(matches!(
            result,
            Err(ExecutionError::Broker(BrokerError::OrderRejected { .. }))
        ));

        let record = svc.registry().get_order(&key).await.unwrap();
        assert_eq!(record.status, SubmissionStatus::Failed);
        assert!(record.failure_reason.unwrap().contains("margin"));
    }

    #[tokio::test]
    async fn foreign_trade_cannot_supersede_an_in_flight_key() {
        let broker = Arc::new(ScriptedBroker::new());
        let svc = service(Arc::clone(&broker));

        // Trade A holds an in-flight record under the key.
        let key = ClientOrderId::new("key-shared");
        let owner = TradeId::new("trade-a");
        svc.registry()
            .record_submission(&key, &owner, 0, serde_json::Value::Null)
            .await
            .unwrap();

        let result = svc
            .submit_entry(&TradeId::new("trade-b"), &intent(), Some(key.clone()))
            .await;
        assert!(matches!(
            result,
            Err(ExecutionError::Registry(
                RegistryError::KeyOwnedByOtherTrade { .. }
            ))
        ));

        // The owner's record is untouched and no broker call was made.
        let record = svc.registry().get_order(&key).await.unwrap();
        assert_eq!(record.trade_id, owner);
        assert_eq!(record.status, SubmissionStatus::Submitted);
        assert!(record.failure_reason.is_none());
        assert_eq!(broker.submit_count(), 0);
    }

    #[tokio::test]
    async fn retries_exhausted_surfaces() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.push_err(BrokerError::Timeout);
        broker.push_err(BrokerError::Timeout);
        broker.push_err(BrokerError::Timeout);
        let svc = service(Arc::clone(&broker));

        let result = svc
            .submit_entry(&TradeId::new("trade-1"), &intent(), None)
            .await;
        assert!(matches!(
            result,
            Err(ExecutionError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(broker.submit_count(), 3);
    }

    #[tokio::test]
    async fn attach_brackets_places_oco_pair() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.push_ok("working"); // take-profit
        broker.push_ok("working"); // stop-loss
        let svc = service(Arc::clone(&broker));
        let trade = TradeId::new("trade-1");
        let entry = BrokerOrderId::new("bo-entry");

        let group = svc
            .attach_brackets(&trade, &intent(), &entry, dec!(2.10))
            .await
            .unwrap();
        assert!(group.take_profit_order_id.is_some());
        assert!(group.stop_loss_order_id.is_some());
        assert_eq!(group.entry_price, dec!(2.10));

        let submits = broker.submits.lock();
        assert_eq!(submits.len(), 2);
        // Take-profit is a buy-back limit at entry x (1 - 50%).
        assert_eq!(submits[0].limit_price, Some(dec!(1.05)));
        assert!(matches!(submits[0].order_type, BrokerOrderType::Limit));
        // Stop-loss triggers at entry + 100% of max loss, OCO-linked to the
        // take-profit order.
        assert_eq!(submits[1].stop_price, Some(dec!(5.00)));
        assert_eq!(
            submits[1].oco_partner.as_ref(),
            group.take_profit_order_id.as_ref()
        );
        // Closing legs flip each entry action.
        assert_eq!(submits[0].legs[0].action, Action::Buy);
        assert_eq!(submits[0].legs[1].action, Action::Sell);
    }

    #[tokio::test]
    async fn attach_brackets_is_idempotent() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.push_ok("working");
        broker.push_ok("working");
        let svc = service(Arc::clone(&broker));
        let trade = TradeId::new("trade-1");
        let entry = BrokerOrderId::new("bo-entry");

        let first = svc
            .attach_brackets(&trade, &intent(), &entry, dec!(2.10))
            .await
            .unwrap();
        let second = svc
            .attach_brackets(&trade, &intent(), &entry, dec!(2.10))
            .await
            .unwrap();

        assert_eq!(first.take_profit_order_id, second.take_profit_order_id);
        assert_eq!(first.stop_loss_order_id, second.stop_loss_order_id);
        // No additional broker submissions for the repeat call.
        assert_eq!(broker.submit_count(), 2);
    }

    #[tokio::test]
    async fn attach_brackets_resumes_partial_group() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.push_ok("working"); // take-profit succeeds
        broker.push_err(BrokerError::OrderRejected {
            reason: "halted".to_string(),
        }); // stop-loss fails
        let svc = service(Arc::clone(&broker));
        let trade = TradeId::new("trade-1");
        let entry = BrokerOrderId::new("bo-entry");

        assert!(svc
            .attach_brackets(&trade, &intent(), &entry, dec!(2.10))
            .await
            .is_err());

        // The retry only places the missing stop-loss leg.
        broker.push_ok("working");
        let group = svc
            .attach_brackets(&trade, &intent(), &entry, dec!(2.10))
            .await
            .unwrap();
        assert!(group.take_profit_order_id.is_some());
        assert!(group.stop_loss_order_id.is_some());
        assert_eq!(broker.submit_count(), 3);
    }

    #[tokio::test]
    async fn cancel_reports_failure_without_erroring() {
        struct FailingCancel;

        #[async_trait::async_trait]
        impl BrokerPort for FailingCancel {
            async fn submit_order(
                &self,
                _request: &SubmitOrderRequest,
            ) -> Result<RawBrokerOrder, BrokerError> {
                unreachable!()
            }
            async fn cancel_order(
                &self,
                order_id: &BrokerOrderId,
                _account_id: &AccountId,
            ) -> Result<(), BrokerError> {
                Err(BrokerError::OrderNotFound {
                    order_id: order_id.as_str().to_string(),
                })
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
                _order_id: &BrokerOrderId,
                _account_id: &AccountId,
            ) -> Result<RawBrokerOrder, BrokerError> {
                unreachable!()
            }
            async fn get_positions(
                &self,
                _account_id: &AccountId,
            ) -> Result<Vec<Position>, BrokerError> {
                Ok(Vec::new())
            }
        }

        let svc = ExecutionService::new(
            Arc::new(FailingCancel),
            Arc::new(InMemoryOrderRegistry::new()),
        );
        let outcome = svc
            .cancel(&BrokerOrderId::new("bo-x"), &AccountId::new("acct-1"))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not found"));
    }
}
