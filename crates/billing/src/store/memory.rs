//! In-memory billing store for tests and local runs
//!
//! Mirrors the Postgres semantics closely enough for service-level tests,
//! including the atomic ledger claim. Individual write paths can be made to
//! fail with [`InMemoryBillingStore::set_fault`].

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use billsync_shared::{PlanId, SubscriptionId, SubscriptionStatus, TenantId, UserId};
use time::{Duration, OffsetDateTime};

use super::BillingStore;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ActivityKind, LedgerClaim, LedgerEntry, Page, Payment, Plan, PlanLimits, PlanUpdate,
    ProcessedEventRecord, ProviderState, StateChange, Subscription, SubscriptionDetail,
    SubscriptionTransaction, SubscriptionUpsert, Tenant, TenantContact,
};

/// Write or read paths that can be forced to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    TenantWrites,
    PlanReads,
    SubscriptionWrites,
    PaymentWrites,
    AuditWrites,
    LedgerClaims,
    LedgerWrites,
    UsageQueries,
}

#[derive(Default)]
struct State {
    tenants: HashMap<TenantId, Tenant>,
    emails: HashMap<UserId, String>,
    plans: HashMap<PlanId, Plan>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    payments: Vec<Payment>,
    transactions: Vec<SubscriptionTransaction>,
    events: HashMap<String, ProcessedEventRecord>,
    activity: Vec<(TenantId, ActivityKind, OffsetDateTime)>,
    faults: HashSet<Fault>,
}

impl State {
    fn fail_on(&self, fault: Fault) -> BillingResult<()> {
        if self.faults.contains(&fault) {
            return Err(BillingError::Storage(format!("injected {fault:?} failure")));
        }
        Ok(())
    }

    fn by_handle_mut(&mut self, handle: &str) -> Option<&mut Subscription> {
        self.subscriptions
            .values_mut()
            .find(|s| s.provider_subscription_id.as_deref() == Some(handle))
    }

    fn detail(&self, sub: &Subscription) -> SubscriptionDetail {
        SubscriptionDetail {
            subscription: sub.clone(),
            tenant_name: self
                .tenants
                .get(&sub.tenant_id)
                .map(|t| t.name.clone())
                .unwrap_or_default(),
            plan_name: self
                .plans
                .get(&sub.plan_id)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
        }
    }
}

fn paginate<T: Clone>(items: &[T], page: Page) -> Vec<T> {
    items
        .iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .cloned()
        .collect()
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the `free` plan at the stock limits
    pub fn with_default_plan() -> Self {
        let store = Self::new();
        store.add_plan("free", 0, PlanLimits::FALLBACK);
        store
    }

    fn state(&self) -> BillingResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BillingError::Storage("in-memory store lock poisoned".into()))
    }

    pub fn set_fault(&self, fault: Fault, enabled: bool) {
        if let Ok(mut state) = self.state() {
            if enabled {
                state.faults.insert(fault);
            } else {
                state.faults.remove(&fault);
            }
        }
    }

    pub fn add_tenant(&self, name: &str, owner_email: &str) -> TenantId {
        let now = OffsetDateTime::now_utc();
        let tenant = Tenant {
            id: TenantId::new(),
            owner_user_id: UserId::new(),
            name: name.to_string(),
            subscription_plan: "free".to_string(),
            created_at: now,
            updated_at: now,
        };
        let id = tenant.id;
        if let Ok(mut state) = self.state() {
            state
                .emails
                .insert(tenant.owner_user_id, owner_email.to_string());
            state.tenants.insert(id, tenant);
        }
        id
    }

    pub fn add_plan(&self, name: &str, price_monthly_minor: i64, limits: PlanLimits) -> PlanId {
        let plan = Plan {
            id: PlanId::new(),
            name: name.to_string(),
            display_name: name.to_string(),
            price_monthly_minor,
            price_yearly_minor: None,
            currency: "IDR".to_string(),
            provider_price_id: Some(format!("price_{name}")),
            limits,
            features: serde_json::json!({}),
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
        };
        let id = plan.id;
        if let Ok(mut state) = self.state() {
            state.plans.insert(id, plan);
        }
        id
    }

    pub fn record_activity(&self, tenant_id: TenantId, kind: ActivityKind, at: OffsetDateTime) {
        if let Ok(mut state) = self.state() {
            state.activity.push((tenant_id, kind, at));
        }
    }

    pub fn tenant(&self, tenant_id: TenantId) -> Option<Tenant> {
        self.state().ok()?.tenants.get(&tenant_id).cloned()
    }

    pub fn subscriptions_for(&self, tenant_id: TenantId) -> Vec<Subscription> {
        let Ok(state) = self.state() else {
            return Vec::new();
        };
        let mut subs: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        subs
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.state().map(|s| s.payments.clone()).unwrap_or_default()
    }

    pub fn transactions(&self) -> Vec<SubscriptionTransaction> {
        self.state()
            .map(|s| s.transactions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Option<Tenant>> {
        Ok(self.state()?.tenants.get(&tenant_id).cloned())
    }

    async fn tenant_contact(&self, tenant_id: TenantId) -> BillingResult<Option<TenantContact>> {
        let state = self.state()?;
        Ok(state.tenants.get(&tenant_id).and_then(|t| {
            state.emails.get(&t.owner_user_id).map(|email| TenantContact {
                tenant_id,
                name: t.name.clone(),
                owner_email: email.clone(),
            })
        }))
    }

    async fn set_tenant_plan_label(
        &self,
        tenant_id: TenantId,
        plan_name: &str,
    ) -> BillingResult<()> {
        let mut state = self.state()?;
        state.fail_on(Fault::TenantWrites)?;
        let tenant = state
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| BillingError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.subscription_plan = plan_name.to_string();
        tenant.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Option<Plan>> {
        let state = self.state()?;
        state.fail_on(Fault::PlanReads)?;
        Ok(state.plans.get(&plan_id).cloned())
    }

    async fn get_plan_by_name(&self, name: &str) -> BillingResult<Option<Plan>> {
        let state = self.state()?;
        state.fail_on(Fault::PlanReads)?;
        Ok(state.plans.values().find(|p| p.name == name).cloned())
    }

    async fn list_plans(&self, page: Page) -> BillingResult<(Vec<Plan>, i64)> {
        let state = self.state()?;
        let mut plans: Vec<_> = state.plans.values().cloned().collect();
        plans.sort_by_key(|p| (p.tier_rank(), p.created_at));
        Ok((paginate(&plans, page), plans.len() as i64))
    }

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let state = self.state()?;
        let mut plans: Vec<_> = state
            .plans
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| {
            (a.price_monthly_minor, &a.name).cmp(&(b.price_monthly_minor, &b.name))
        });
        Ok(plans)
    }

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut state = self.state()?;
        if state.plans.values().any(|p| p.name == plan.name) {
            return Err(BillingError::Conflict(format!(
                "plan '{}' already exists",
                plan.name
            )));
        }
        state.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn update_plan(
        &self,
        plan_id: PlanId,
        update: &PlanUpdate,
    ) -> BillingResult<Option<Plan>> {
        let mut state = self.state()?;
        Ok(state.plans.get_mut(&plan_id).map(|plan| {
            update.apply(plan);
            plan.updated_at = Some(OffsetDateTime::now_utc());
            plan.clone()
        }))
    }

    async fn count_active_subscriptions_for_plan(&self, plan_id: PlanId) -> BillingResult<i64> {
        let state = self.state()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| {
                s.plan_id == plan_id
                    && matches!(
                        s.status,
                        SubscriptionStatus::Active
                            | SubscriptionStatus::Trialing
                            | SubscriptionStatus::PastDue
                    )
            })
            .count() as i64)
    }

    async fn active_plan_limits(&self, tenant_id: TenantId) -> BillingResult<Option<PlanLimits>> {
        let state = self.state()?;
        state.fail_on(Fault::PlanReads)?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.status == SubscriptionStatus::Active)
            .max_by_key(|s| s.updated_at)
            .and_then(|s| state.plans.get(&s.plan_id))
            .map(|p| p.limits))
    }

    async fn upsert_subscription(
        &self,
        upsert: &SubscriptionUpsert,
    ) -> BillingResult<StateChange> {
        let mut state = self.state()?;
        state.fail_on(Fault::SubscriptionWrites)?;
        let now = OffsetDateTime::now_utc();
        let handle = upsert.provider_subscription_id.as_str();
        let session = upsert.checkout_session_id.as_deref();
        let handle_known = state.by_handle_mut(handle).is_some();

        let pending_id = session.and_then(|sid| {
            state
                .subscriptions
                .values()
                .find(|s| {
                    s.checkout_session_id.as_deref() == Some(sid)
                        && s.provider_subscription_id.is_none()
                })
                .map(|s| s.id)
        });

        if !handle_known {
            if let Some(sub) = pending_id.and_then(|id| state.subscriptions.get_mut(&id)) {
                sub.provider_subscription_id = Some(handle.to_string());
            }
        } else if let Some(sub) = pending_id.and_then(|id| state.subscriptions.get_mut(&id)) {
            sub.status = SubscriptionStatus::Canceled;
            sub.canceled_at = Some(now);
            sub.updated_at = now;
        }

        let st = &upsert.state;
        if let Some(sub) = state.by_handle_mut(handle) {
            let previous = Some(sub.status);
            sub.status = st.status;
            sub.current_period_start = st.current_period_start;
            sub.current_period_end = st.current_period_end;
            sub.cancel_at_period_end = st.cancel_at_period_end;
            if upsert.provider_customer_id.is_some() {
                sub.provider_customer_id = upsert.provider_customer_id.clone();
            }
            if st.status == SubscriptionStatus::Canceled && sub.canceled_at.is_none() {
                sub.canceled_at = Some(now);
            }
            sub.updated_at = now;
            return Ok(StateChange {
                previous,
                current: sub.clone(),
            });
        }

        let sub = Subscription {
            id: SubscriptionId::new(),
            tenant_id: upsert.tenant_id,
            plan_id: upsert.plan_id,
            status: st.status,
            provider_subscription_id: Some(handle.to_string()),
            provider_customer_id: upsert.provider_customer_id.clone(),
            checkout_session_id: None,
            current_period_start: st.current_period_start,
            current_period_end: st.current_period_end,
            cancel_at_period_end: st.cancel_at_period_end,
            canceled_at: (st.status == SubscriptionStatus::Canceled).then_some(now),
            created_at: now,
            updated_at: now,
        };
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(StateChange {
            previous: None,
            current: sub,
        })
    }

    async fn update_provider_state(
        &self,
        provider_subscription_id: &str,
        st: &ProviderState,
    ) -> BillingResult<Option<StateChange>> {
        let mut state = self.state()?;
        state.fail_on(Fault::SubscriptionWrites)?;
        let now = OffsetDateTime::now_utc();
        Ok(state.by_handle_mut(provider_subscription_id).map(|sub| {
            let previous = Some(sub.status);
            sub.status = st.status;
            sub.current_period_start = st.current_period_start;
            sub.current_period_end = st.current_period_end;
            sub.cancel_at_period_end = st.cancel_at_period_end;
            if st.status == SubscriptionStatus::Canceled && sub.canceled_at.is_none() {
                sub.canceled_at = Some(now);
            }
            sub.updated_at = now;
            StateChange {
                previous,
                current: sub.clone(),
            }
        }))
    }

    async fn set_status_by_handle(
        &self,
        provider_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<Option<StateChange>> {
        let mut state = self.state()?;
        state.fail_on(Fault::SubscriptionWrites)?;
        Ok(state.by_handle_mut(provider_subscription_id).map(|sub| {
            let previous = Some(sub.status);
            sub.status = status;
            sub.updated_at = OffsetDateTime::now_utc();
            StateChange {
                previous,
                current: sub.clone(),
            }
        }))
    }

    async fn cancel_by_handle(
        &self,
        provider_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<StateChange>> {
        let mut state = self.state()?;
        state.fail_on(Fault::SubscriptionWrites)?;
        Ok(state.by_handle_mut(provider_subscription_id).map(|sub| {
            let previous = Some(sub.status);
            sub.status = SubscriptionStatus::Canceled;
            sub.canceled_at = Some(canceled_at);
            sub.updated_at = OffsetDateTime::now_utc();
            StateChange {
                previous,
                current: sub.clone(),
            }
        }))
    }

    async fn find_by_handle(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let mut state = self.state()?;
        Ok(state.by_handle_mut(provider_subscription_id).map(|s| s.clone()))
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> BillingResult<Option<SubscriptionDetail>> {
        let state = self.state()?;
        Ok(state.subscriptions.get(&id).map(|s| state.detail(s)))
    }

    async fn list_subscriptions(
        &self,
        page: Page,
    ) -> BillingResult<(Vec<SubscriptionDetail>, i64)> {
        let state = self.state()?;
        let mut subs: Vec<_> = state.subscriptions.values().collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let details: Vec<_> = subs.into_iter().map(|s| state.detail(s)).collect();
        Ok((paginate(&details, page), details.len() as i64))
    }

    async fn current_subscription(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<SubscriptionDetail>> {
        let state = self.state()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.status.is_entitled())
            .max_by_key(|s| s.updated_at)
            .map(|s| state.detail(s)))
    }

    async fn find_customer_handle(&self, tenant_id: TenantId) -> BillingResult<Option<String>> {
        let state = self.state()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .filter_map(|s| s.provider_customer_id.clone().map(|c| (s.created_at, c)))
            .max_by_key(|(created_at, _)| *created_at)
            .map(|(_, c)| c))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut state = self.state()?;
        state.fail_on(Fault::SubscriptionWrites)?;
        let clashes = state.subscriptions.values().any(|s| {
            (s.provider_subscription_id.is_some()
                && s.provider_subscription_id == subscription.provider_subscription_id)
                || (s.checkout_session_id.is_some()
                    && s.checkout_session_id == subscription.checkout_session_id)
        });
        if clashes {
            return Err(BillingError::Conflict("subscription already exists".into()));
        }
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn insert_subscription_audited(
        &self,
        subscription: &Subscription,
        audit: &SubscriptionTransaction,
    ) -> BillingResult<()> {
        let mut state = self.state()?;
        state.fail_on(Fault::SubscriptionWrites)?;
        state.fail_on(Fault::AuditWrites)?;
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::Conflict("subscription already exists".into()));
        }
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        state.transactions.push(audit.clone());
        Ok(())
    }

    async fn update_subscription_audited(
        &self,
        id: SubscriptionId,
        expected: SubscriptionStatus,
        plan_id: Option<PlanId>,
        status: Option<SubscriptionStatus>,
        audit: &SubscriptionTransaction,
    ) -> BillingResult<Subscription> {
        let mut state = self.state()?;
        state.fail_on(Fault::SubscriptionWrites)?;
        state.fail_on(Fault::AuditWrites)?;
        let now = OffsetDateTime::now_utc();

        let sub = state
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {id}")))?;
        if sub.status != expected {
            return Err(BillingError::Conflict(format!(
                "subscription {id} is now {}, expected {expected}",
                sub.status
            )));
        }
        if let Some(plan_id) = plan_id {
            sub.plan_id = plan_id;
        }
        if let Some(status) = status {
            sub.status = status;
            if status == SubscriptionStatus::Canceled && sub.canceled_at.is_none() {
                sub.canceled_at = Some(now);
            }
        }
        sub.updated_at = now;
        let updated = sub.clone();

        state.transactions.push(audit.clone());
        Ok(updated)
    }

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<bool> {
        let mut state = self.state()?;
        state.fail_on(Fault::PaymentWrites)?;
        if state
            .payments
            .iter()
            .any(|p| p.provider_invoice_id == payment.provider_invoice_id)
        {
            return Ok(false);
        }
        state.payments.push(payment.clone());
        Ok(true)
    }

    async fn list_payments(&self, subscription_id: SubscriptionId) -> BillingResult<Vec<Payment>> {
        let state = self.state()?;
        let mut payments: Vec<_> = state
            .payments
            .iter()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.paid_at.cmp(&a.paid_at));
        Ok(payments)
    }

    async fn insert_transaction(&self, tx: &SubscriptionTransaction) -> BillingResult<()> {
        let mut state = self.state()?;
        state.fail_on(Fault::AuditWrites)?;
        state.transactions.push(tx.clone());
        Ok(())
    }

    async fn list_transactions(
        &self,
        subscription_id: SubscriptionId,
        page: Page,
    ) -> BillingResult<(Vec<SubscriptionTransaction>, i64)> {
        let state = self.state()?;
        // Insertion order breaks ties between rows written in the same instant
        let mut txs: Vec<_> = state
            .transactions
            .iter()
            .enumerate()
            .filter(|(_, t)| t.subscription_id == subscription_id)
            .collect();
        txs.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        let txs: Vec<_> = txs.into_iter().map(|(_, t)| t.clone()).collect();
        Ok((paginate(&txs, page), txs.len() as i64))
    }

    async fn claim_event(
        &self,
        entry: &LedgerEntry,
        stale_after: Duration,
    ) -> BillingResult<LedgerClaim> {
        let mut guard = self.state()?;
        guard.fail_on(Fault::LedgerClaims)?;
        let events = &mut guard.events;
        let now = OffsetDateTime::now_utc();

        match events.get_mut(&entry.provider_event_id) {
            None => {
                events.insert(
                    entry.provider_event_id.clone(),
                    ProcessedEventRecord {
                        provider_event_id: entry.provider_event_id.clone(),
                        event_kind: entry.event_kind.clone(),
                        payload: entry.payload.clone(),
                        processed: false,
                        processing_started_at: Some(now),
                        processed_at: None,
                        last_error: None,
                        created_at: now,
                    },
                );
                Ok(LedgerClaim::Claimed)
            }
            Some(record) if record.processed => Ok(LedgerClaim::AlreadyProcessed),
            Some(record) => match record.processing_started_at {
                Some(started) if now - started < stale_after => Ok(LedgerClaim::InFlight),
                _ => {
                    record.processing_started_at = Some(now);
                    record.payload = entry.payload.clone();
                    Ok(LedgerClaim::Claimed)
                }
            },
        }
    }

    async fn mark_event_processed(&self, provider_event_id: &str) -> BillingResult<()> {
        let mut state = self.state()?;
        state.fail_on(Fault::LedgerWrites)?;
        if let Some(record) = state.events.get_mut(provider_event_id) {
            record.processed = true;
            record.processed_at = Some(OffsetDateTime::now_utc());
            record.processing_started_at = None;
            record.last_error = None;
        }
        Ok(())
    }

    async fn release_event(&self, provider_event_id: &str, error: &str) -> BillingResult<()> {
        let mut state = self.state()?;
        state.fail_on(Fault::LedgerWrites)?;
        if let Some(record) = state.events.get_mut(provider_event_id) {
            if !record.processed {
                record.processing_started_at = None;
                record.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn get_event(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<ProcessedEventRecord>> {
        Ok(self.state()?.events.get(provider_event_id).cloned())
    }

    async fn count_activity(
        &self,
        tenant_id: TenantId,
        kind: ActivityKind,
        since: OffsetDateTime,
    ) -> BillingResult<i64> {
        let state = self.state()?;
        state.fail_on(Fault::UsageQueries)?;
        Ok(state
            .activity
            .iter()
            .filter(|(t, k, at)| *t == tenant_id && *k == kind && *at >= since)
            .count() as i64)
    }
}
