//! Subscription management
//!
//! Locally initiated changes (admin tooling, manual grants). Unlike webhook
//! handlers these go through [`SubscriptionStatus::can_transition_to`] and
//! commit the audit row in the same store write as the change itself. The
//! write only applies if the status is still the one the transition was
//! checked against.

use std::sync::Arc;

use billsync_shared::{SubscriptionId, SubscriptionStatus, TenantId};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};

use crate::error::{best_effort, BillingError, BillingResult, WriteClass};
use crate::history::{AuditEntry, SubscriptionHistory};
use crate::models::{
    Actor, Page, Paginated, Plan, Subscription, SubscriptionDetail, SubscriptionTransaction,
    TransactionKind,
};
use crate::plans::PlanCatalog;
use crate::store::BillingStore;

#[derive(Debug, Clone, Deserialize)]
pub struct StatusChangeRequest {
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanChangeRequest {
    /// Plan id or plan name
    pub plan: String,
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Subscription granted without a checkout
#[derive(Debug, Clone, Deserialize)]
pub struct ManualSubscriptionRequest {
    pub tenant_id: TenantId,
    /// Plan id or plan name
    pub plan: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    plans: PlanCatalog,
    history: SubscriptionHistory,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, plans: PlanCatalog) -> Self {
        Self {
            history: SubscriptionHistory::new(store.clone()),
            store,
            plans,
        }
    }

    pub async fn get(&self, id: SubscriptionId) -> BillingResult<SubscriptionDetail> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {id}")))
    }

    pub async fn list(&self, page: Page) -> BillingResult<Paginated<SubscriptionDetail>> {
        let (items, total) = self.store.list_subscriptions(page).await?;
        Ok(Paginated::new(items, page, total))
    }

    /// The tenant's live (`active` or `trialing`) subscription, if any
    pub async fn current_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<SubscriptionDetail>> {
        self.store.current_subscription(tenant_id).await
    }

    pub async fn transactions(
        &self,
        id: SubscriptionId,
        page: Page,
    ) -> BillingResult<Paginated<SubscriptionTransaction>> {
        self.get(id).await?;
        self.history.list(id, page).await
    }

    pub async fn update_status(
        &self,
        id: SubscriptionId,
        request: StatusChangeRequest,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        let current = self.get(id).await?.subscription;
        let next = request.status;
        ensure_transition(current.status, next)?;
        if current.status == next {
            return Ok(current);
        }

        let kind = if next == SubscriptionStatus::Canceled {
            TransactionKind::Cancel
        } else {
            TransactionKind::StatusChange
        };
        let audit = AuditEntry::new(&current, kind, actor)
            .statuses(Some(current.status), Some(next))
            .metadata(serde_json::json!({ "source": "admin", "reason": request.reason }))
            .build();
        let updated = self
            .store
            .update_subscription_audited(id, current.status, None, Some(next), &audit)
            .await?;

        if next == SubscriptionStatus::Canceled {
            best_effort(
                WriteClass::Secondary,
                "tenant plan label",
                self.store
                    .set_tenant_plan_label(updated.tenant_id, self.plans.default_plan_name())
                    .await,
            )?;
        }

        tracing::info!(
            subscription_id = %id,
            from = %current.status,
            to = %next,
            actor = %actor,
            "Subscription status changed"
        );
        Ok(updated)
    }

    pub async fn change_plan(
        &self,
        id: SubscriptionId,
        request: PlanChangeRequest,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        let current = self.get(id).await?.subscription;
        if current.status.is_terminal() {
            return Err(BillingError::Validation(
                "cannot change the plan of a canceled subscription".into(),
            ));
        }
        if let Some(next) = request.status {
            ensure_transition(current.status, next)?;
        }

        let new_plan = self.plans.find(&request.plan).await?;
        if !new_plan.is_active {
            return Err(BillingError::Validation(format!(
                "plan '{}' is not active",
                new_plan.name
            )));
        }
        let old_plan = self.plans.get(current.plan_id).await.ok();
        let kind = plan_change_kind(old_plan.as_ref(), &new_plan);

        let audit = AuditEntry::new(&current, kind, actor)
            .plans(Some(current.plan_id), Some(new_plan.id))
            .statuses(
                Some(current.status),
                Some(request.status.unwrap_or(current.status)),
            )
            .metadata(serde_json::json!({
                "source": "admin",
                "new_plan_name": new_plan.name,
                "reason": request.reason,
            }))
            .build();
        let updated = self
            .store
            .update_subscription_audited(
                id,
                current.status,
                Some(new_plan.id),
                request.status,
                &audit,
            )
            .await?;

        let label = if updated.status.is_terminal() {
            self.plans.default_plan_name().to_string()
        } else {
            new_plan.name.clone()
        };
        best_effort(
            WriteClass::Secondary,
            "tenant plan label",
            self.store
                .set_tenant_plan_label(updated.tenant_id, &label)
                .await,
        )?;

        tracing::info!(
            subscription_id = %id,
            plan = %new_plan.name,
            kind = kind.as_str(),
            actor = %actor,
            "Subscription plan changed"
        );
        Ok(updated)
    }

    pub async fn create_manual(
        &self,
        request: ManualSubscriptionRequest,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        if self.store.get_tenant(request.tenant_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("tenant {}", request.tenant_id)));
        }
        let plan = self.plans.find(&request.plan).await?;

        let start = request
            .current_period_start
            .unwrap_or_else(OffsetDateTime::now_utc);
        let end = request
            .current_period_end
            .unwrap_or_else(|| add_one_month(start));
        if end <= start {
            return Err(BillingError::Validation(
                "current_period_end must be after current_period_start".into(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            tenant_id: request.tenant_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            provider_subscription_id: None,
            provider_customer_id: None,
            checkout_session_id: None,
            current_period_start: start,
            current_period_end: end,
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        };
        let audit = AuditEntry::new(&subscription, TransactionKind::Create, actor)
            .metadata(serde_json::json!({ "source": "admin", "plan_name": plan.name }))
            .build();
        self.store
            .insert_subscription_audited(&subscription, &audit)
            .await?;

        best_effort(
            WriteClass::Secondary,
            "tenant plan label",
            self.store
                .set_tenant_plan_label(subscription.tenant_id, &plan.name)
                .await,
        )?;

        tracing::info!(
            subscription_id = %subscription.id,
            tenant_id = %subscription.tenant_id,
            plan = %plan.name,
            "Created manual subscription"
        );
        Ok(subscription)
    }
}

fn ensure_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> BillingResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn plan_change_kind(old: Option<&Plan>, new: &Plan) -> TransactionKind {
    match old {
        Some(old) if new.price_monthly_minor > old.price_monthly_minor => TransactionKind::Upgrade,
        Some(old) if new.price_monthly_minor < old.price_monthly_minor => {
            TransactionKind::Downgrade
        }
        _ => TransactionKind::StatusChange,
    }
}

/// Same day next month, clamped to the month's last day
fn add_one_month(start: OffsetDateTime) -> OffsetDateTime {
    let date = start.date();
    let (year, month) = match date.month().next() {
        time::Month::January => (date.year() + 1, time::Month::January),
        m => (date.year(), m),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    time::Date::from_calendar_date(year, month, day)
        .map(|d| start.replace_date(d))
        .unwrap_or_else(|_| start + Duration::days(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanLimits;
    use crate::store::{Fault, InMemoryBillingStore};
    use billsync_shared::{PlanId, UserId};
    use time::macros::datetime;

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        service: SubscriptionService,
        tenant: TenantId,
        pro: PlanId,
        team: PlanId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let pro = store.add_plan("pro", 150_000, PlanLimits::default());
        let team = store.add_plan("team", 300_000, PlanLimits::default());
        let plans = PlanCatalog::new(store.clone(), "free");
        let service = SubscriptionService::new(store.clone(), plans);
        Fixture {
            store,
            service,
            tenant,
            pro,
            team,
        }
    }

    fn to_status(status: SubscriptionStatus) -> StatusChangeRequest {
        StatusChangeRequest {
            status,
            reason: None,
        }
    }

    fn to_plan(plan: impl Into<String>) -> PlanChangeRequest {
        PlanChangeRequest {
            plan: plan.into(),
            status: None,
            reason: None,
        }
    }

    async fn manual(f: &Fixture, plan: &str) -> Subscription {
        f.service
            .create_manual(
                ManualSubscriptionRequest {
                    tenant_id: f.tenant,
                    plan: plan.into(),
                    current_period_start: None,
                    current_period_end: None,
                },
                Actor::System,
            )
            .await
            .unwrap()
    }

    async fn persisted(f: &Fixture, id: SubscriptionId) -> Subscription {
        f.service.get(id).await.unwrap().subscription
    }

    #[tokio::test]
    async fn manual_subscription_is_active_and_labels_tenant() {
        let f = fixture();
        let sub = manual(&f, "pro").await;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan_id, f.pro);
        assert_eq!(f.store.tenant(f.tenant).unwrap().subscription_plan, "pro");

        let txs = f.store.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::Create);
    }

    #[tokio::test]
    async fn manual_subscription_not_created_without_audit_row() {
        let f = fixture();
        f.store.set_fault(Fault::AuditWrites, true);

        let result = f
            .service
            .create_manual(
                ManualSubscriptionRequest {
                    tenant_id: f.tenant,
                    plan: "pro".into(),
                    current_period_start: None,
                    current_period_end: None,
                },
                Actor::System,
            )
            .await;
        assert!(matches!(result, Err(BillingError::Storage(_))));
        assert!(f.store.subscriptions_for(f.tenant).is_empty());
        assert!(f.store.transactions().is_empty());
    }

    #[tokio::test]
    async fn status_change_respects_lifecycle() {
        let f = fixture();
        let sub = manual(&f, "pro").await;
        let admin = Actor::User(UserId::new());

        let past_due = f
            .service
            .update_status(sub.id, to_status(SubscriptionStatus::PastDue), admin)
            .await
            .unwrap();
        assert_eq!(past_due.status, SubscriptionStatus::PastDue);

        let back = f
            .service
            .update_status(sub.id, to_status(SubscriptionStatus::Trialing), admin)
            .await;
        assert!(matches!(back, Err(BillingError::InvalidTransition { .. })));

        let cancel = StatusChangeRequest {
            status: SubscriptionStatus::Canceled,
            reason: Some("fraud".into()),
        };
        f.service.update_status(sub.id, cancel, admin).await.unwrap();
        assert_eq!(f.store.tenant(f.tenant).unwrap().subscription_plan, "free");

        let revive = f
            .service
            .update_status(sub.id, to_status(SubscriptionStatus::Active), admin)
            .await;
        assert!(matches!(revive, Err(BillingError::InvalidTransition { .. })));

        let page = f.service.transactions(sub.id, Page::default()).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items[0].kind, TransactionKind::Cancel);
        assert_eq!(page.items[0].actor, admin);
    }

    #[tokio::test]
    async fn status_change_is_not_saved_when_audit_write_fails() {
        let f = fixture();
        let sub = manual(&f, "pro").await;
        f.store.set_fault(Fault::AuditWrites, true);

        let result = f
            .service
            .update_status(sub.id, to_status(SubscriptionStatus::Canceled), Actor::System)
            .await;
        assert!(matches!(result, Err(BillingError::Storage(_))));

        let stored = persisted(&f, sub.id).await;
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert!(stored.canceled_at.is_none());
        assert_eq!(f.store.transactions().len(), 1);

        // Retrying once the audit log is back records the change properly
        f.store.set_fault(Fault::AuditWrites, false);
        f.service
            .update_status(sub.id, to_status(SubscriptionStatus::Canceled), Actor::System)
            .await
            .unwrap();
        let page = f.service.transactions(sub.id, Page::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].kind, TransactionKind::Cancel);
    }

    #[tokio::test]
    async fn plan_change_is_not_saved_when_audit_write_fails() {
        let f = fixture();
        let sub = manual(&f, "pro").await;
        f.store.set_fault(Fault::AuditWrites, true);

        let result = f.service.change_plan(sub.id, to_plan("team"), Actor::System).await;
        assert!(matches!(result, Err(BillingError::Storage(_))));
        assert_eq!(persisted(&f, sub.id).await.plan_id, f.pro);
        assert_eq!(f.store.transactions().len(), 1);
    }

    #[tokio::test]
    async fn admin_write_refused_after_concurrent_cancel() {
        let f = fixture();
        let sub = manual(&f, "pro").await;

        // The admin read saw `active`; a provider cancellation lands first
        f.service
            .update_status(sub.id, to_status(SubscriptionStatus::Canceled), Actor::System)
            .await
            .unwrap();
        let stale = AuditEntry::new(&sub, TransactionKind::StatusChange, Actor::System)
            .statuses(Some(SubscriptionStatus::Active), Some(SubscriptionStatus::PastDue))
            .build();
        let result = f
            .store
            .update_subscription_audited(
                sub.id,
                SubscriptionStatus::Active,
                None,
                Some(SubscriptionStatus::PastDue),
                &stale,
            )
            .await;

        assert!(matches!(result, Err(BillingError::Conflict(_))));
        assert_eq!(persisted(&f, sub.id).await.status, SubscriptionStatus::Canceled);
        assert_eq!(f.store.transactions().len(), 2);
    }

    #[tokio::test]
    async fn plan_change_classifies_direction() {
        let f = fixture();
        let sub = manual(&f, "pro").await;

        f.service
            .change_plan(sub.id, to_plan("team"), Actor::System)
            .await
            .unwrap();
        f.service
            .change_plan(sub.id, to_plan(f.pro.to_string()), Actor::System)
            .await
            .unwrap();

        let page = f.service.transactions(sub.id, Page::default()).await.unwrap();
        let kinds: Vec<_> = page.items.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransactionKind::Downgrade,
                TransactionKind::Upgrade,
                TransactionKind::Create
            ]
        );
        assert_eq!(page.items[1].new_plan_id, Some(f.team));
        assert_eq!(f.store.tenant(f.tenant).unwrap().subscription_plan, "pro");
    }

    #[tokio::test]
    async fn plan_change_survives_label_failure() {
        let f = fixture();
        let sub = manual(&f, "pro").await;
        f.store.set_fault(Fault::TenantWrites, true);

        let updated = f
            .service
            .change_plan(sub.id, to_plan("team"), Actor::System)
            .await
            .unwrap();
        assert_eq!(updated.plan_id, f.team);
        assert_eq!(f.store.tenant(f.tenant).unwrap().subscription_plan, "pro");
    }

    #[tokio::test]
    async fn unknown_plan_and_subscription_are_not_found() {
        let f = fixture();
        let sub = manual(&f, "pro").await;
        let missing_plan = f
            .service
            .change_plan(sub.id, to_plan("enterprise"), Actor::System)
            .await;
        assert!(matches!(missing_plan, Err(BillingError::NotFound(_))));

        assert!(matches!(
            f.service.get(SubscriptionId::new()).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn current_subscription_ignores_canceled_rows() {
        let f = fixture();
        let sub = manual(&f, "pro").await;
        let current = f.service.current_for_tenant(f.tenant).await.unwrap();
        assert_eq!(current.unwrap().plan_name, "pro");

        f.service
            .update_status(sub.id, to_status(SubscriptionStatus::Canceled), Actor::System)
            .await
            .unwrap();
        assert!(f.service.current_for_tenant(f.tenant).await.unwrap().is_none());
    }

    #[test]
    fn one_month_later_clamps_to_month_end() {
        assert_eq!(
            add_one_month(datetime!(2025-01-31 10:00 UTC)),
            datetime!(2025-02-28 10:00 UTC)
        );
        assert_eq!(
            add_one_month(datetime!(2024-12-15 00:00 UTC)),
            datetime!(2025-01-15 00:00 UTC)
        );
    }
}
