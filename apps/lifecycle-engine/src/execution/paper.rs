//! Paper broker - an in-process broker for dry runs and tests.
//!
//! Orders rest as working until filled through [`PaperBroker::fill_order`]
//! or constructed with immediate fills enabled. OCO links are honored: a
//! fill cancels the partner order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::shared::{AccountId, BrokerOrderId};

use super::broker::{
    BrokerError, BrokerPort, Position, RawBrokerOrder, ReplaceOrderRequest, SubmitOrderRequest,
};

#[derive(Debug, Clone)]
struct PaperOrder {
    raw: RawBrokerOrder,
    oco_partner: Option<BrokerOrderId>,
}

/// In-memory broker implementation.
#[derive(Debug, Default)]
pub struct PaperBroker {
    orders: RwLock<HashMap<String, PaperOrder>>,
    next_id: AtomicU64,
    fill_immediately: bool,
}

impl PaperBroker {
    /// A paper broker where orders rest as working.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A paper broker that fills every order at its limit price on submit.
    #[must_use]
    pub fn filling_immediately() -> Self {
        Self {
            fill_immediately: true,
            ..Self::default()
        }
    }

    /// Fill a resting order at a price, cancelling its OCO partner.
    ///
    /// Returns false when the order does not exist or is not active.
    pub fn fill_order(&self, order_id: &BrokerOrderId, price: Decimal) -> bool {
        let mut orders = self.orders.write();
        let partner = match orders.get_mut(order_id.as_str()) {
            Some(order) if is_active(&order.raw.status) => {
                fill(&mut order.raw, price);
                order.oco_partner.clone()
            }
            _ => return false,
        };
        if let Some(partner_id) = partner {
            if let Some(partner) = orders.get_mut(partner_id.as_str()) {
                if is_active(&partner.raw.status) {
                    partner.raw.status = "cancelled".to_string();
                    debug!(order_id = %partner_id, "paper OCO partner cancelled");
                }
            }
        }
        true
    }

    /// Reject a resting order, for failure-path tests.
    pub fn reject_order(&self, order_id: &BrokerOrderId) -> bool {
        let mut orders = self.orders.write();
        match orders.get_mut(order_id.as_str()) {
            Some(order) if is_active(&order.raw.status) => {
                order.raw.status = "rejected".to_string();
                true
            }
            _ => false,
        }
    }

    /// Number of orders the broker has seen.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }

    fn allocate_id(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

fn is_active(status: &str) -> bool {
    matches!(status, "working" | "pending_new" | "partially_filled")
}

fn fill(raw: &mut RawBrokerOrder, price: Decimal) {
    raw.status = "filled".to_string();
    raw.filled_quantity = raw.quantity;
    raw.avg_fill_price = Some(price);
}

#[async_trait]
impl BrokerPort for PaperBroker {
    async fn submit_order(
        &self,
        request: &SubmitOrderRequest,
    ) -> Result<RawBrokerOrder, BrokerError> {
        let id = self.allocate_id();
        let mut raw = RawBrokerOrder {
            id: Some(id.clone()),
            client_order_id: Some(request.client_order_id.as_str().to_string()),
            status: "working".to_string(),
            quantity: Some(Decimal::from(request.quantity)),
            filled_quantity: Some(Decimal::ZERO),
            limit_price: request.limit_price,
            order_type: Some(
                match request.order_type {
                    super::broker::BrokerOrderType::Limit => "limit",
                    super::broker::BrokerOrderType::Market => "market",
                    super::broker::BrokerOrderType::StopLimit => "stop_limit",
                }
                .to_string(),
            ),
            ..Default::default()
        };

        if self.fill_immediately {
            let price = request.limit_price.unwrap_or_default();
            fill(&mut raw, price);
        }

        debug!(order_id = %id, status = %raw.status, "paper order accepted");
        self.orders.write().insert(
            id,
            PaperOrder {
                raw: raw.clone(),
                oco_partner: request.oco_partner.clone(),
            },
        );
        Ok(raw)
    }

    async fn cancel_order(
        &self,
        order_id: &BrokerOrderId,
        _account_id: &AccountId,
    ) -> Result<(), BrokerError> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id.as_str())
            .ok_or_else(|| BrokerError::OrderNotFound {
                order_id: order_id.as_str().to_string(),
            })?;
        if !is_active(&order.raw.status) {
            return Err(BrokerError::OrderRejected {
                reason: format!("order is {}", order.raw.status),
            });
        }
        order.raw.status = "cancelled".to_string();
        Ok(())
    }

    async fn replace_order(
        &self,
        order_id: &BrokerOrderId,
        _account_id: &AccountId,
        changes: &ReplaceOrderRequest,
    ) -> Result<RawBrokerOrder, BrokerError> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id.as_str())
            .ok_or_else(|| BrokerError::OrderNotFound {
                order_id: order_id.as_str().to_string(),
            })?;
        if !is_active(&order.raw.status) {
            return Err(BrokerError::OrderRejected {
                reason: format!("order is {}", order.raw.status),
            });
        }
        if let Some(price) = changes.price {
            order.raw.limit_price = Some(price);
        }
        if let Some(quantity) = changes.quantity {
            order.raw.quantity = Some(quantity);
        }
        Ok(order.raw.clone())
    }

    async fn get_order(
        &self,
        order_id: &BrokerOrderId,
        _account_id: &AccountId,
    ) -> Result<RawBrokerOrder, BrokerError> {
        self.orders
            .read()
            .get(order_id.as_str())
            .map(|order| order.raw.clone())
            .ok_or_else(|| BrokerError::OrderNotFound {
                order_id: order_id.as_str().to_string(),
            })
    }

    async fn get_positions(&self, _account_id: &AccountId) -> Result<Vec<Position>, BrokerError> {
        Ok(Vec::new())
    }
}
