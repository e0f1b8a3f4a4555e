//! PostgreSQL-backed billing store

use async_trait::async_trait;
use billsync_shared::{PlanId, SubscriptionId, SubscriptionStatus, TenantId};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::BillingStore;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ActivityKind, LedgerClaim, LedgerEntry, Page, Payment, Plan, PlanLimits, PlanUpdate,
    ProcessedEventRecord, ProviderState, StateChange, Subscription, SubscriptionDetail,
    SubscriptionTransaction, SubscriptionUpsert, Tenant, TenantContact,
};

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock the row holding `handle` and return its current status
    async fn lock_status(
        tx: &mut Transaction<'_, Postgres>,
        handle: &str,
    ) -> BillingResult<Option<SubscriptionStatus>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM subscriptions WHERE stripe_subscription_id = $1 FOR UPDATE",
        )
        .bind(handle)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|(s,)| parse_status(&s)).transpose()
    }
}

// =============================================================================
// Rows
// =============================================================================

fn parse_status(s: &str) -> BillingResult<SubscriptionStatus> {
    s.parse()
        .map_err(|e| BillingError::Storage(format!("corrupt subscription row: {e}")))
}

#[derive(FromRow)]
struct TenantRow {
    id: Uuid,
    owner_user_id: Uuid,
    name: String,
    subscription_plan: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id.into(),
            owner_user_id: row.owner_user_id.into(),
            name: row.name,
            subscription_plan: row.subscription_plan,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    display_name: String,
    price_monthly_minor: i64,
    price_yearly_minor: Option<i64>,
    currency: String,
    stripe_price_id_monthly: Option<String>,
    max_chats_per_month: Option<i32>,
    max_file_uploads_per_month: Option<i32>,
    max_file_size_mb: Option<i32>,
    max_forecast_refreshes_per_month: Option<i32>,
    features: serde_json::Value,
    is_active: bool,
    created_at: OffsetDateTime,
    updated_at: Option<OffsetDateTime>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id.into(),
            name: row.name,
            display_name: row.display_name,
            price_monthly_minor: row.price_monthly_minor,
            price_yearly_minor: row.price_yearly_minor,
            currency: row.currency,
            provider_price_id: row.stripe_price_id_monthly,
            limits: PlanLimits {
                max_chats_per_month: row.max_chats_per_month,
                max_file_uploads_per_month: row.max_file_uploads_per_month,
                max_file_size_mb: row.max_file_size_mb,
                max_forecast_refreshes_per_month: row.max_forecast_refreshes_per_month,
            },
            features: row.features,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct LimitsRow {
    max_chats_per_month: Option<i32>,
    max_file_uploads_per_month: Option<i32>,
    max_file_size_mb: Option<i32>,
    max_forecast_refreshes_per_month: Option<i32>,
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    company_id: Uuid,
    plan_id: Uuid,
    status: String,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    stripe_checkout_session_id: Option<String>,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id.into(),
            tenant_id: row.company_id.into(),
            plan_id: row.plan_id.into(),
            status: parse_status(&row.status)?,
            provider_subscription_id: row.stripe_subscription_id,
            provider_customer_id: row.stripe_customer_id,
            checkout_session_id: row.stripe_checkout_session_id,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SubscriptionDetailRow {
    #[sqlx(flatten)]
    subscription: SubscriptionRow,
    tenant_name: String,
    plan_name: String,
}

impl TryFrom<SubscriptionDetailRow> for SubscriptionDetail {
    type Error = BillingError;

    fn try_from(row: SubscriptionDetailRow) -> BillingResult<Self> {
        Ok(SubscriptionDetail {
            subscription: row.subscription.try_into()?,
            tenant_name: row.tenant_name,
            plan_name: row.plan_name,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    subscription_id: Uuid,
    company_id: Uuid,
    amount_minor: i64,
    currency: String,
    status: String,
    stripe_payment_intent_id: Option<String>,
    stripe_invoice_id: String,
    paid_at: OffsetDateTime,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            id: row.id.into(),
            subscription_id: row.subscription_id.into(),
            tenant_id: row.company_id.into(),
            amount_minor: row.amount_minor,
            currency: row.currency,
            status: row.status,
            provider_payment_intent_id: row.stripe_payment_intent_id,
            provider_invoice_id: row.stripe_invoice_id,
            paid_at: row.paid_at,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    subscription_id: Uuid,
    company_id: Uuid,
    event_type: String,
    old_plan_id: Option<Uuid>,
    new_plan_id: Option<Uuid>,
    old_status: Option<String>,
    new_status: Option<String>,
    actor: String,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for SubscriptionTransaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> BillingResult<Self> {
        Ok(SubscriptionTransaction {
            id: row.id.into(),
            subscription_id: row.subscription_id.into(),
            tenant_id: row.company_id.into(),
            kind: row.event_type.parse()?,
            old_plan_id: row.old_plan_id.map(PlanId::from),
            new_plan_id: row.new_plan_id.map(PlanId::from),
            old_status: row.old_status.as_deref().map(parse_status).transpose()?,
            new_status: row.new_status.as_deref().map(parse_status).transpose()?,
            actor: row.actor.parse()?,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    provider_event_id: String,
    event_kind: String,
    payload: String,
    processed: bool,
    processing_started_at: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    created_at: OffsetDateTime,
}

impl From<EventRow> for ProcessedEventRecord {
    fn from(row: EventRow) -> Self {
        ProcessedEventRecord {
            provider_event_id: row.provider_event_id,
            event_kind: row.event_kind,
            payload: row.payload,
            processed: row.processed,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
            last_error: row.last_error,
            created_at: row.created_at,
        }
    }
}

const DETAIL_SELECT: &str = r#"
    SELECT s.*, c.name AS tenant_name, p.name AS plan_name
    FROM subscriptions s
    JOIN companies c ON c.id = s.company_id
    JOIN subscription_plans p ON p.id = s.plan_id
"#;

// =============================================================================
// Store
// =============================================================================

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(
            r#"
            SELECT id, owner_user_id, name, subscription_plan, created_at, updated_at
            FROM companies
            WHERE id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Tenant::from))
    }

    async fn tenant_contact(&self, tenant_id: TenantId) -> BillingResult<Option<TenantContact>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT c.name, u.email
            FROM companies c
            JOIN users u ON u.id = c.owner_user_id
            WHERE c.id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(name, owner_email)| TenantContact {
            tenant_id,
            name,
            owner_email,
        }))
    }

    async fn set_tenant_plan_label(
        &self,
        tenant_id: TenantId,
        plan_name: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE companies SET subscription_plan = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(tenant_id.as_uuid())
        .bind(plan_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("tenant {tenant_id}")));
        }
        Ok(())
    }

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as("SELECT * FROM subscription_plans WHERE id = $1")
            .bind(plan_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Plan::from))
    }

    async fn get_plan_by_name(&self, name: &str) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as("SELECT * FROM subscription_plans WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Plan::from))
    }

    async fn list_plans(&self, page: Page) -> BillingResult<(Vec<Plan>, i64)> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT * FROM subscription_plans
            ORDER BY
                CASE name
                    WHEN 'free' THEN 0
                    WHEN 'pro' THEN 1
                    WHEN 'enterprise' THEN 2
                    ELSE 3
                END,
                created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM subscription_plans")
            .fetch_one(&self.pool)
            .await?;

        Ok((rows.into_iter().map(Plan::from).collect(), total))
    }

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT * FROM subscription_plans
            WHERE is_active = TRUE
            ORDER BY price_monthly_minor ASC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_plans (
                id, name, display_name, price_monthly_minor, price_yearly_minor, currency,
                stripe_price_id_monthly, max_chats_per_month, max_file_uploads_per_month,
                max_file_size_mb, max_forecast_refreshes_per_month, features, is_active,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(plan.id.as_uuid())
        .bind(&plan.name)
        .bind(&plan.display_name)
        .bind(plan.price_monthly_minor)
        .bind(plan.price_yearly_minor)
        .bind(&plan.currency)
        .bind(&plan.provider_price_id)
        .bind(plan.limits.max_chats_per_month)
        .bind(plan.limits.max_file_uploads_per_month)
        .bind(plan.limits.max_file_size_mb)
        .bind(plan.limits.max_forecast_refreshes_per_month)
        .bind(&plan.features)
        .bind(plan.is_active)
        .bind(plan.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::from_write(e, &format!("plan '{}'", plan.name)))?;

        Ok(())
    }

    async fn update_plan(
        &self,
        plan_id: PlanId,
        update: &PlanUpdate,
    ) -> BillingResult<Option<Plan>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<PlanRow> =
            sqlx::query_as("SELECT * FROM subscription_plans WHERE id = $1 FOR UPDATE")
                .bind(plan_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut plan = Plan::from(row);
        update.apply(&mut plan);

        let updated: PlanRow = sqlx::query_as(
            r#"
            UPDATE subscription_plans SET
                display_name = $2,
                price_monthly_minor = $3,
                price_yearly_minor = $4,
                currency = $5,
                stripe_price_id_monthly = $6,
                max_chats_per_month = $7,
                max_file_uploads_per_month = $8,
                max_file_size_mb = $9,
                max_forecast_refreshes_per_month = $10,
                features = $11,
                is_active = $12,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(plan.id.as_uuid())
        .bind(&plan.display_name)
        .bind(plan.price_monthly_minor)
        .bind(plan.price_yearly_minor)
        .bind(&plan.currency)
        .bind(&plan.provider_price_id)
        .bind(plan.limits.max_chats_per_month)
        .bind(plan.limits.max_file_uploads_per_month)
        .bind(plan.limits.max_file_size_mb)
        .bind(plan.limits.max_forecast_refreshes_per_month)
        .bind(&plan.features)
        .bind(plan.is_active)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(updated.into()))
    }

    async fn count_active_subscriptions_for_plan(&self, plan_id: PlanId) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM subscriptions
            WHERE plan_id = $1 AND status IN ('active', 'trialing', 'past_due')
            "#,
        )
        .bind(plan_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn active_plan_limits(&self, tenant_id: TenantId) -> BillingResult<Option<PlanLimits>> {
        let row: Option<LimitsRow> = sqlx::query_as(
            r#"
            SELECT p.max_chats_per_month, p.max_file_uploads_per_month,
                   p.max_file_size_mb, p.max_forecast_refreshes_per_month
            FROM subscriptions s
            JOIN subscription_plans p ON p.id = s.plan_id
            WHERE s.company_id = $1 AND s.status = 'active'
            ORDER BY s.updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PlanLimits {
            max_chats_per_month: r.max_chats_per_month,
            max_file_uploads_per_month: r.max_file_uploads_per_month,
            max_file_size_mb: r.max_file_size_mb,
            max_forecast_refreshes_per_month: r.max_forecast_refreshes_per_month,
        }))
    }

    async fn upsert_subscription(
        &self,
        upsert: &SubscriptionUpsert,
    ) -> BillingResult<StateChange> {
        let handle = upsert.provider_subscription_id.as_str();
        let mut tx = self.pool.begin().await?;

        let mut previous = Self::lock_status(&mut tx, handle).await?;
        let handle_known = previous.is_some();

        if let (false, Some(session_id)) = (handle_known, upsert.checkout_session_id.as_deref()) {
            let adopted: Option<(String,)> = sqlx::query_as(
                r#"
                UPDATE subscriptions SET stripe_subscription_id = $1, updated_at = NOW()
                WHERE stripe_checkout_session_id = $2 AND stripe_subscription_id IS NULL
                RETURNING status
                "#,
            )
            .bind(handle)
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
            previous = adopted.map(|(s,)| parse_status(&s)).transpose()?;
        }

        let state = &upsert.state;
        let row: SubscriptionRow = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                id, company_id, plan_id, status, stripe_subscription_id, stripe_customer_id,
                current_period_start, current_period_end, cancel_at_period_end, canceled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                    CASE WHEN $4 = 'canceled' THEN NOW() END)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                canceled_at = CASE
                    WHEN EXCLUDED.status = 'canceled'
                        THEN COALESCE(subscriptions.canceled_at, NOW())
                    ELSE subscriptions.canceled_at
                END,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(upsert.tenant_id.as_uuid())
        .bind(upsert.plan_id.as_uuid())
        .bind(state.status.as_str())
        .bind(handle)
        .bind(&upsert.provider_customer_id)
        .bind(state.current_period_start)
        .bind(state.current_period_end)
        .bind(state.cancel_at_period_end)
        .fetch_one(&mut *tx)
        .await?;

        if let (true, Some(session_id)) = (handle_known, upsert.checkout_session_id.as_deref()) {
            // The subscription event arrived first; the pending checkout row is now orphaned
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'canceled', canceled_at = NOW(), updated_at = NOW()
                WHERE stripe_checkout_session_id = $1 AND stripe_subscription_id IS NULL
                "#,
            )
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(StateChange {
            previous,
            current: row.try_into()?,
        })
    }

    async fn update_provider_state(
        &self,
        provider_subscription_id: &str,
        state: &ProviderState,
    ) -> BillingResult<Option<StateChange>> {
        let mut tx = self.pool.begin().await?;
        let Some(previous) = Self::lock_status(&mut tx, provider_subscription_id).await? else {
            return Ok(None);
        };

        let row: SubscriptionRow = sqlx::query_as(
            r#"
            UPDATE subscriptions SET
                status = $2,
                current_period_start = $3,
                current_period_end = $4,
                cancel_at_period_end = $5,
                canceled_at = CASE WHEN $2 = 'canceled' THEN COALESCE(canceled_at, NOW())
                                   ELSE canceled_at END,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING *
            "#,
        )
        .bind(provider_subscription_id)
        .bind(state.status.as_str())
        .bind(state.current_period_start)
        .bind(state.current_period_end)
        .bind(state.cancel_at_period_end)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(StateChange {
            previous: Some(previous),
            current: row.try_into()?,
        }))
    }

    async fn set_status_by_handle(
        &self,
        provider_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<Option<StateChange>> {
        let mut tx = self.pool.begin().await?;
        let Some(previous) = Self::lock_status(&mut tx, provider_subscription_id).await? else {
            return Ok(None);
        };

        let row: SubscriptionRow = sqlx::query_as(
            r#"
            UPDATE subscriptions SET status = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING *
            "#,
        )
        .bind(provider_subscription_id)
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(StateChange {
            previous: Some(previous),
            current: row.try_into()?,
        }))
    }

    async fn cancel_by_handle(
        &self,
        provider_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<StateChange>> {
        let mut tx = self.pool.begin().await?;
        let Some(previous) = Self::lock_status(&mut tx, provider_subscription_id).await? else {
            return Ok(None);
        };

        let row: SubscriptionRow = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING *
            "#,
        )
        .bind(provider_subscription_id)
        .bind(canceled_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(StateChange {
            previous: Some(previous),
            current: row.try_into()?,
        }))
    }

    async fn find_by_handle(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE stripe_subscription_id = $1")
                .bind(provider_subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> BillingResult<Option<SubscriptionDetail>> {
        let row: Option<SubscriptionDetailRow> =
            sqlx::query_as(&format!("{DETAIL_SELECT} WHERE s.id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        row.map(SubscriptionDetail::try_from).transpose()
    }

    async fn list_subscriptions(
        &self,
        page: Page,
    ) -> BillingResult<(Vec<SubscriptionDetail>, i64)> {
        let rows: Vec<SubscriptionDetailRow> = sqlx::query_as(&format!(
            "{DETAIL_SELECT} ORDER BY s.created_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM subscriptions")
            .fetch_one(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(SubscriptionDetail::try_from)
            .collect::<BillingResult<Vec<_>>>()?;
        Ok((items, total))
    }

    async fn current_subscription(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<SubscriptionDetail>> {
        let row: Option<SubscriptionDetailRow> = sqlx::query_as(&format!(
            r#"{DETAIL_SELECT}
            WHERE s.company_id = $1 AND s.status IN ('active', 'trialing')
            ORDER BY s.updated_at DESC
            LIMIT 1"#
        ))
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionDetail::try_from).transpose()
    }

    async fn find_customer_handle(&self, tenant_id: TenantId) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_customer_id FROM subscriptions
            WHERE company_id = $1 AND stripe_customer_id IS NOT NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(handle,)| handle))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, company_id, plan_id, status, stripe_subscription_id, stripe_customer_id,
                stripe_checkout_session_id, current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(subscription.id.as_uuid())
        .bind(subscription.tenant_id.as_uuid())
        .bind(subscription.plan_id.as_uuid())
        .bind(subscription.status.as_str())
        .bind(&subscription.provider_subscription_id)
        .bind(&subscription.provider_customer_id)
        .bind(&subscription.checkout_session_id)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::from_write(e, "subscription"))?;

        Ok(())
    }

    async fn insert_subscription_audited(
        &self,
        subscription: &Subscription,
        audit: &SubscriptionTransaction,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, company_id, plan_id, status, stripe_subscription_id, stripe_customer_id,
                stripe_checkout_session_id, current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(subscription.id.as_uuid())
        .bind(subscription.tenant_id.as_uuid())
        .bind(subscription.plan_id.as_uuid())
        .bind(subscription.status.as_str())
        .bind(&subscription.provider_subscription_id)
        .bind(&subscription.provider_customer_id)
        .bind(&subscription.checkout_session_id)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::from_write(e, "subscription"))?;

        insert_transaction_row(&mut *tx, audit).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            UPDATE subscriptions SET
                plan_id = COALESCE($3, plan_id),
                status = COALESCE($4, status),
                canceled_at = CASE WHEN $4 = 'canceled' THEN COALESCE(canceled_at, NOW())
                                   ELSE canceled_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(plan_id.map(|p| p.as_uuid()))
        .bind(status.map(|s| s.as_str()))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let current: Option<(String,)> =
                sqlx::query_as("SELECT status FROM subscriptions WHERE id = $1")
                    .bind(id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match current {
                Some((actual,)) => BillingError::Conflict(format!(
                    "subscription {id} is now {actual}, expected {expected}"
                )),
                None => BillingError::NotFound(format!("subscription {id}")),
            });
        };
        let updated = Subscription::try_from(row)?;

        insert_transaction_row(&mut *tx, audit).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payments (
                id, subscription_id, company_id, amount_minor, currency, status,
                stripe_payment_intent_id, stripe_invoice_id, paid_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (stripe_invoice_id) DO NOTHING
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.subscription_id.as_uuid())
        .bind(payment.tenant_id.as_uuid())
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(&payment.status)
        .bind(&payment.provider_payment_intent_id)
        .bind(&payment.provider_invoice_id)
        .bind(payment.paid_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_payments(&self, subscription_id: SubscriptionId) -> BillingResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            "SELECT * FROM payments WHERE subscription_id = $1 ORDER BY paid_at DESC",
        )
        .bind(subscription_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Payment::from).collect())
    }

    async fn insert_transaction(&self, tx: &SubscriptionTransaction) -> BillingResult<()> {
        insert_transaction_row(&self.pool, tx).await
    }

    async fn list_transactions(
        &self,
        subscription_id: SubscriptionId,
        page: Page,
    ) -> BillingResult<(Vec<SubscriptionTransaction>, i64)> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT * FROM subscription_transactions
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(subscription_id.as_uuid())
        .bind(page.limit)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM subscription_transactions WHERE subscription_id = $1",
        )
        .bind(subscription_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(SubscriptionTransaction::try_from)
            .collect::<BillingResult<Vec<_>>>()?;
        Ok((items, total))
    }

    async fn claim_event(
        &self,
        entry: &LedgerEntry,
        stale_after: Duration,
    ) -> BillingResult<LedgerClaim> {
        // Only one concurrent caller gets a row back. A claim that never
        // finished and is older than `stale_after` may be taken over.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events
                (id, provider_event_id, event_kind, payload, processed, processing_started_at)
            VALUES ($1, $2, $3, $4, FALSE, NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_started_at = NOW(),
                payload = EXCLUDED.payload
            WHERE processed_webhook_events.processed = FALSE
              AND (processed_webhook_events.processing_started_at IS NULL
                   OR processed_webhook_events.processing_started_at
                        < NOW() - make_interval(secs => $5))
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.provider_event_id)
        .bind(&entry.event_kind)
        .bind(&entry.payload)
        .bind(stale_after.as_seconds_f64())
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(LedgerClaim::Claimed);
        }

        let processed: Option<(bool,)> = sqlx::query_as(
            "SELECT processed FROM processed_webhook_events WHERE provider_event_id = $1",
        )
        .bind(&entry.provider_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match processed {
            Some((true,)) => LedgerClaim::AlreadyProcessed,
            _ => LedgerClaim::InFlight,
        })
    }

    async fn mark_event_processed(&self, provider_event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET processed = TRUE, processed_at = NOW(),
                processing_started_at = NULL, last_error = NULL
            WHERE provider_event_id = $1
            "#,
        )
        .bind(provider_event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_event(&self, provider_event_id: &str, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET processing_started_at = NULL, last_error = $2
            WHERE provider_event_id = $1 AND processed = FALSE
            "#,
        )
        .bind(provider_event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_event(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<ProcessedEventRecord>> {
        let row: Option<EventRow> = sqlx::query_as(
            "SELECT * FROM processed_webhook_events WHERE provider_event_id = $1",
        )
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ProcessedEventRecord::from))
    }

    async fn count_activity(
        &self,
        tenant_id: TenantId,
        kind: ActivityKind,
        since: OffsetDateTime,
    ) -> BillingResult<i64> {
        let sql = match kind {
            ActivityKind::UserMessage => {
                r#"
                SELECT COUNT(*) FROM messages m
                JOIN conversations c ON c.id = m.conversation_id
                WHERE c.company_id = $1 AND m.sender = 'user' AND m.created_at >= $2
                "#
            }
            ActivityKind::FileUpload => {
                "SELECT COUNT(*) FROM file_uploads WHERE company_id = $1 AND created_at >= $2"
            }
            ActivityKind::Forecast => {
                "SELECT COUNT(*) FROM forecasts WHERE company_id = $1 AND created_at >= $2"
            }
        };

        let (count,): (i64,) = sqlx::query_as(sql)
            .bind(tenant_id.as_uuid())
            .bind(since)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

async fn insert_transaction_row<'e, E>(
    executor: E,
    tx: &SubscriptionTransaction,
) -> BillingResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO subscription_transactions (
            id, subscription_id, company_id, event_type, old_plan_id, new_plan_id,
            old_status, new_status, actor, metadata, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(tx.id.as_uuid())
    .bind(tx.subscription_id.as_uuid())
    .bind(tx.tenant_id.as_uuid())
    .bind(tx.kind.as_str())
    .bind(tx.old_plan_id.map(|p| p.as_uuid()))
    .bind(tx.new_plan_id.map(|p| p.as_uuid()))
    .bind(tx.old_status.map(|s| s.as_str()))
    .bind(tx.new_status.map(|s| s.as_str()))
    .bind(tx.actor.as_db_string())
    .bind(&tx.metadata)
    .bind(tx.created_at)
    .execute(executor)
    .await?;

    Ok(())
}
