//! Persistence boundary for billing state
//!
//! [`BillingStore`] is the single seam between the services and storage.
//! [`PgBillingStore`] backs production; [`InMemoryBillingStore`] backs tests
//! and can inject failures into individual write paths.
//!
//! Every method is one atomic unit. Nothing here holds a lock across a call to
//! the payment provider or the mail API; the services sequence those.

mod memory;
mod postgres;

pub use memory::{Fault, InMemoryBillingStore};
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use billsync_shared::{PlanId, SubscriptionId, SubscriptionStatus, TenantId};
use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::models::{
    ActivityKind, LedgerClaim, LedgerEntry, Page, Payment, Plan, PlanLimits, PlanUpdate,
    ProcessedEventRecord, ProviderState, StateChange, Subscription, SubscriptionDetail,
    SubscriptionTransaction, SubscriptionUpsert, Tenant, TenantContact,
};

#[async_trait]
pub trait BillingStore: Send + Sync {
    // -- tenants --------------------------------------------------------------

    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Option<Tenant>>;

    async fn tenant_contact(&self, tenant_id: TenantId) -> BillingResult<Option<TenantContact>>;

    /// Overwrite the denormalised plan label. `NotFound` if the tenant is unknown.
    async fn set_tenant_plan_label(&self, tenant_id: TenantId, plan_name: &str)
        -> BillingResult<()>;

    // -- plans ----------------------------------------------------------------

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Option<Plan>>;

    async fn get_plan_by_name(&self, name: &str) -> BillingResult<Option<Plan>>;

    async fn list_plans(&self, page: Page) -> BillingResult<(Vec<Plan>, i64)>;

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>>;

    /// `Conflict` when the name is taken
    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()>;

    async fn update_plan(&self, plan_id: PlanId, update: &PlanUpdate)
        -> BillingResult<Option<Plan>>;

    async fn count_active_subscriptions_for_plan(&self, plan_id: PlanId) -> BillingResult<i64>;

    /// Limits of the plan behind the tenant's most recent `active` subscription
    async fn active_plan_limits(&self, tenant_id: TenantId) -> BillingResult<Option<PlanLimits>>;

    // -- subscriptions ----------------------------------------------------------

    /// Create or overwrite the row for `upsert.provider_subscription_id`.
    ///
    /// A pending checkout row named by `checkout_session_id` is adopted when no
    /// row holds the handle yet, and retired otherwise.
    async fn upsert_subscription(&self, upsert: &SubscriptionUpsert)
        -> BillingResult<StateChange>;

    /// Overwrite provider state on an existing row; `None` when no row has the handle
    async fn update_provider_state(
        &self,
        provider_subscription_id: &str,
        state: &ProviderState,
    ) -> BillingResult<Option<StateChange>>;

    async fn set_status_by_handle(
        &self,
        provider_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<Option<StateChange>>;

    async fn cancel_by_handle(
        &self,
        provider_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<StateChange>>;

    async fn find_by_handle(&self, provider_subscription_id: &str)
        -> BillingResult<Option<Subscription>>;

    async fn get_subscription(&self, id: SubscriptionId)
        -> BillingResult<Option<SubscriptionDetail>>;

    async fn list_subscriptions(&self, page: Page)
        -> BillingResult<(Vec<SubscriptionDetail>, i64)>;

    /// Most recently updated `active` or `trialing` subscription
    async fn current_subscription(&self, tenant_id: TenantId)
        -> BillingResult<Option<SubscriptionDetail>>;

    /// Any customer handle previously recorded for the tenant
    async fn find_customer_handle(&self, tenant_id: TenantId) -> BillingResult<Option<String>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Insert a subscription and its audit row; both land or neither does
    async fn insert_subscription_audited(
        &self,
        subscription: &Subscription,
        audit: &SubscriptionTransaction,
    ) -> BillingResult<()>;

    /// Admin overwrite of plan and/or status, committed with its audit row.
    ///
    /// Applies only while the row is still in `expected` status; a concurrent
    /// change in between yields `Conflict` and writes nothing. `NotFound` if
    /// the row is gone.
    async fn update_subscription_audited(
        &self,
        id: SubscriptionId,
        expected: SubscriptionStatus,
        plan_id: Option<PlanId>,
        status: Option<SubscriptionStatus>,
        audit: &SubscriptionTransaction,
    ) -> BillingResult<Subscription>;

    // -- payments ---------------------------------------------------------------

    /// `false` when a payment for the same invoice already exists
    async fn insert_payment(&self, payment: &Payment) -> BillingResult<bool>;

    async fn list_payments(&self, subscription_id: SubscriptionId) -> BillingResult<Vec<Payment>>;

    // -- audit log ----------------------------------------------------------------

    async fn insert_transaction(&self, tx: &SubscriptionTransaction) -> BillingResult<()>;

    /// Newest first
    async fn list_transactions(
        &self,
        subscription_id: SubscriptionId,
        page: Page,
    ) -> BillingResult<(Vec<SubscriptionTransaction>, i64)>;

    // -- webhook ledger -------------------------------------------------------------

    /// Atomically take processing rights. A claim older than `stale_after`
    /// that never completed can be taken over.
    async fn claim_event(&self, entry: &LedgerEntry, stale_after: Duration)
        -> BillingResult<LedgerClaim>;

    async fn mark_event_processed(&self, provider_event_id: &str) -> BillingResult<()>;

    /// Drop the claim so redelivery can retry, keeping the failure reason
    async fn release_event(&self, provider_event_id: &str, error: &str) -> BillingResult<()>;

    async fn get_event(&self, provider_event_id: &str)
        -> BillingResult<Option<ProcessedEventRecord>>;

    // -- usage ------------------------------------------------------------------------

    async fn count_activity(
        &self,
        tenant_id: TenantId,
        kind: ActivityKind,
        since: OffsetDateTime,
    ) -> BillingResult<i64>;
}
