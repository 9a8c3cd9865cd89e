//! In-memory order registry.
//!
//! The default registry for a single-process deployment; the port allows a
//! durable implementation to be swapped in without touching callers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::domain::shared::{BrokerOrderId, ClientOrderId, TradeId};

use super::{IdempotencyRecord, OcoGroup, OrderRegistry, RegistryError, SubmissionStatus};

/// In-memory implementation of `OrderRegistry`.
#[derive(Debug, Default)]
pub struct InMemoryOrderRegistry {
    records: RwLock<HashMap<ClientOrderId, IdempotencyRecord>>,
    groups: RwLock<HashMap<BrokerOrderId, OcoGroup>>,
}

impl InMemoryOrderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of idempotency records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl OrderRegistry for InMemoryOrderRegistry {
    async fn record_submission(
        &self,
        key: &ClientOrderId,
        trade_id: &TradeId,
        retry_count: u32,
        metadata: serde_json::Value,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write();

        if let Some(existing) = records.get(key) {
            if existing.trade_id != *trade_id {
                return Err(RegistryError::KeyOwnedByOtherTrade {
                    key: key.clone(),
                    owner: existing.trade_id.clone(),
                });
            }
            // Same attempt: only a failed record may be superseded, and only
            // by a retry with a strictly higher count.
            if existing.status != SubmissionStatus::Failed || retry_count <= existing.retry_count {
                return Err(RegistryError::SubmissionOutstanding { key: key.clone() });
            }
        }

        let now = Utc::now();
        records.insert(
            key.clone(),
            IdempotencyRecord {
                client_order_id: key.clone(),
                trade_id: trade_id.clone(),
                status: SubmissionStatus::Submitted,
                retry_count,
                broker_order_id: None,
                failure_reason: None,
                metadata,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn confirm_submission(
        &self,
        key: &ClientOrderId,
        broker_order_id: &BrokerOrderId,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write();

        let conflict = records.values().any(|r| {
            r.client_order_id != *key
                && r.status != SubmissionStatus::Failed
                && r.broker_order_id.as_ref() == Some(broker_order_id)
        });
        if conflict {
            return Err(RegistryError::DuplicateBrokerOrder {
                broker_order_id: broker_order_id.clone(),
            });
        }

        let record = records
            .get_mut(key)
            .ok_or_else(|| RegistryError::RecordNotFound { key: key.clone() })?;
        record.status = SubmissionStatus::Confirmed;
        record.broker_order_id = Some(broker_order_id.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, key: &ClientOrderId, reason: &str) -> Result<(), RegistryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| RegistryError::RecordNotFound { key: key.clone() })?;
        record.status = SubmissionStatus::Failed;
        record.failure_reason = Some(reason.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn is_submitted(&self, key: &ClientOrderId) -> bool {
        self.records
            .read()
            .get(key)
            .is_some_and(|r| r.status != SubmissionStatus::Failed)
    }

    async fn get_order(&self, key: &ClientOrderId) -> Option<IdempotencyRecord> {
        self.records.read().get(key).cloned()
    }

    async fn store_oco_group(&self, group: OcoGroup) -> Result<(), RegistryError> {
        let mut groups = self.groups.write();
        groups.insert(group.entry_order_id.clone(), group);
        Ok(())
    }

    async fn get_oco_group(&self, entry_order_id: &BrokerOrderId) -> Option<OcoGroup> {
        self.groups.read().get(entry_order_id).cloned()
    }

    async fn update_oco_group(&self, group: OcoGroup) -> Result<(), RegistryError> {
        let mut groups = self.groups.write();
        if !groups.contains_key(&group.entry_order_id) {
            return Err(RegistryError::GroupNotFound {
                entry_order_id: group.entry_order_id.clone(),
            });
        }
        groups.insert(group.entry_order_id.clone(), group);
        Ok(())
    }
}
