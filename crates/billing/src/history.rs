//! Subscription audit log
//!
//! Append-only. Rows are written when an explicit application action changes
//! a subscription (checkout creation, admin status or plan change) and
//! opportunistically for provider-driven changes.

use std::sync::Arc;

use billsync_shared::{PlanId, SubscriptionId, SubscriptionStatus, TransactionId};
use time::OffsetDateTime;

use crate::error::{best_effort, BillingResult, WriteClass};
use crate::models::{
    Actor, Page, Paginated, Subscription, SubscriptionTransaction, TransactionKind,
};
use crate::store::BillingStore;

/// Builder for one audit row
#[derive(Debug, Clone)]
pub struct AuditEntry {
    tx: SubscriptionTransaction,
}

impl AuditEntry {
    pub fn new(subscription: &Subscription, kind: TransactionKind, actor: Actor) -> Self {
        Self {
            tx: SubscriptionTransaction {
                id: TransactionId::new(),
                subscription_id: subscription.id,
                tenant_id: subscription.tenant_id,
                kind,
                old_plan_id: None,
                new_plan_id: Some(subscription.plan_id),
                old_status: None,
                new_status: Some(subscription.status),
                actor,
                metadata: serde_json::json!({}),
                created_at: OffsetDateTime::now_utc(),
            },
        }
    }

    pub fn plans(mut self, old: Option<PlanId>, new: Option<PlanId>) -> Self {
        self.tx.old_plan_id = old;
        self.tx.new_plan_id = new;
        self
    }

    pub fn statuses(
        mut self,
        old: Option<SubscriptionStatus>,
        new: Option<SubscriptionStatus>,
    ) -> Self {
        self.tx.old_status = old;
        self.tx.new_status = new;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.tx.metadata = metadata;
        self
    }

    pub fn build(self) -> SubscriptionTransaction {
        self.tx
    }
}

#[derive(Clone)]
pub struct SubscriptionHistory {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionHistory {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Append a row. Secondary writes log and return `Ok` on failure.
    pub async fn record(&self, class: WriteClass, entry: AuditEntry) -> BillingResult<()> {
        let tx = entry.build();
        tracing::debug!(
            subscription_id = %tx.subscription_id,
            kind = tx.kind.as_str(),
            actor = %tx.actor,
            "Recording subscription transaction"
        );
        best_effort(
            class,
            "subscription transaction",
            self.store.insert_transaction(&tx).await,
        )?;
        Ok(())
    }

    /// Newest first
    pub async fn list(
        &self,
        subscription_id: SubscriptionId,
        page: Page,
    ) -> BillingResult<Paginated<SubscriptionTransaction>> {
        let (items, total) = self.store.list_transactions(subscription_id, page).await?;
        Ok(Paginated::new(items, page, total))
    }
}
