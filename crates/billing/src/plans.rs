//! Plan catalogue and plan-limit resolution

use std::sync::Arc;

use billsync_shared::{PlanId, TenantId};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{NewPlan, Page, Paginated, Plan, PlanLimits, PlanUpdate};
use crate::store::BillingStore;

pub const DEFAULT_CURRENCY: &str = "IDR";

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn BillingStore>,
    default_plan_name: String,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn BillingStore>, default_plan_name: impl Into<String>) -> Self {
        Self {
            store,
            default_plan_name: default_plan_name.into(),
        }
    }

    pub fn default_plan_name(&self) -> &str {
        &self.default_plan_name
    }

    /// Limits that apply to `tenant_id` right now.
    ///
    /// Falls back to the default plan when the tenant has no active
    /// subscription, then to [`PlanLimits::FALLBACK`] if that plan is
    /// missing. Storage errors take the next fallback instead of failing.
    pub async fn resolve_limits(&self, tenant_id: TenantId) -> PlanLimits {
        match self.store.active_plan_limits(tenant_id).await {
            Ok(Some(limits)) => return limits,
            Ok(None) => {}
            Err(e) => tracing::warn!(
                tenant_id = %tenant_id,
                error = %e,
                "Failed to read active plan limits, using default plan"
            ),
        }

        match self.store.get_plan_by_name(&self.default_plan_name).await {
            Ok(Some(plan)) => plan.limits,
            Ok(None) => {
                tracing::warn!(
                    plan = %self.default_plan_name,
                    "Default plan missing from catalogue, using built-in limits"
                );
                PlanLimits::FALLBACK
            }
            Err(e) => {
                tracing::warn!(
                    plan = %self.default_plan_name,
                    error = %e,
                    "Failed to read default plan, using built-in limits"
                );
                PlanLimits::FALLBACK
            }
        }
    }

    pub async fn list_active(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_active_plans().await
    }

    pub async fn list(&self, page: Page) -> BillingResult<Paginated<Plan>> {
        let (items, total) = self.store.list_plans(page).await?;
        Ok(Paginated::new(items, page, total))
    }

    pub async fn get(&self, plan_id: PlanId) -> BillingResult<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {plan_id}")))
    }

    /// Look a plan up by id, or by name when `reference` is not a UUID
    pub async fn find(&self, reference: &str) -> BillingResult<Plan> {
        let found = match reference.parse::<PlanId>() {
            Ok(id) => self.store.get_plan(id).await?,
            Err(_) => self.store.get_plan_by_name(reference.trim()).await?,
        };
        found.ok_or_else(|| BillingError::NotFound(format!("plan '{reference}'")))
    }

    pub async fn create(&self, new: NewPlan) -> BillingResult<Plan> {
        let name = new.name.trim().to_lowercase();
        if name.is_empty() {
            return Err(BillingError::Validation("plan name is required".into()));
        }
        if new.display_name.trim().is_empty() {
            return Err(BillingError::Validation("display name is required".into()));
        }
        validate_price(Some(new.price_monthly_minor))?;
        validate_price(new.price_yearly_minor)?;
        validate_limits(&new.limits)?;
        let currency = normalise_currency(new.currency.as_deref())?;

        let plan = Plan {
            id: PlanId::new(),
            name,
            display_name: new.display_name.trim().to_string(),
            price_monthly_minor: new.price_monthly_minor,
            price_yearly_minor: new.price_yearly_minor,
            currency,
            provider_price_id: new.provider_price_id,
            limits: new.limits,
            features: new.features.unwrap_or_else(|| serde_json::json!({})),
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
        };

        self.store.insert_plan(&plan).await?;
        tracing::info!(plan_id = %plan.id, plan = %plan.name, "Created plan");
        Ok(plan)
    }

    pub async fn update(&self, plan_id: PlanId, mut update: PlanUpdate) -> BillingResult<Plan> {
        validate_price(update.price_monthly_minor)?;
        validate_price(update.price_yearly_minor)?;
        validate_limits(&PlanLimits {
            max_chats_per_month: update.max_chats_per_month,
            max_file_uploads_per_month: update.max_file_uploads_per_month,
            max_file_size_mb: update.max_file_size_mb,
            max_forecast_refreshes_per_month: update.max_forecast_refreshes_per_month,
        })?;
        if let Some(currency) = update.currency.as_deref() {
            update.currency = Some(normalise_currency(Some(currency))?);
        }
        if update.is_active == Some(false) {
            self.ensure_unused(plan_id).await?;
        }

        self.store
            .update_plan(plan_id, &update)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {plan_id}")))
    }

    /// Hide a plan from new checkouts. Refused while live subscriptions use it.
    pub async fn deactivate(&self, plan_id: PlanId) -> BillingResult<Plan> {
        self.update(
            plan_id,
            PlanUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    async fn ensure_unused(&self, plan_id: PlanId) -> BillingResult<()> {
        let in_use = self
            .store
            .count_active_subscriptions_for_plan(plan_id)
            .await?;
        if in_use > 0 {
            return Err(BillingError::Conflict(format!(
                "plan {plan_id} has {in_use} live subscription(s)"
            )));
        }
        Ok(())
    }
}

fn validate_price(price: Option<i64>) -> BillingResult<()> {
    match price {
        Some(p) if p < 0 => Err(BillingError::Validation("price cannot be negative".into())),
        _ => Ok(()),
    }
}

fn validate_limits(limits: &PlanLimits) -> BillingResult<()> {
    let all = [
        limits.max_chats_per_month,
        limits.max_file_uploads_per_month,
        limits.max_file_size_mb,
        limits.max_forecast_refreshes_per_month,
    ];
    if all.iter().flatten().any(|v| *v < 0) {
        return Err(BillingError::Validation("limits cannot be negative".into()));
    }
    Ok(())
}

fn normalise_currency(currency: Option<&str>) -> BillingResult<String> {
    let code = currency
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(BillingError::Validation(format!(
            "'{code}' is not an ISO currency code"
        )));
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProviderState, SubscriptionUpsert};
    use crate::store::{Fault, InMemoryBillingStore};
    use billsync_shared::SubscriptionStatus;

    fn catalog(store: &Arc<InMemoryBillingStore>) -> PlanCatalog {
        PlanCatalog::new(store.clone(), "free")
    }

    fn pro_limits() -> PlanLimits {
        PlanLimits {
            max_chats_per_month: Some(1000),
            max_file_uploads_per_month: Some(100),
            max_file_size_mb: Some(50),
            max_forecast_refreshes_per_month: None,
        }
    }

    async fn activate(store: &InMemoryBillingStore, tenant: TenantId, plan: PlanId, handle: &str) {
        let now = OffsetDateTime::now_utc();
        store
            .upsert_subscription(&SubscriptionUpsert {
                tenant_id: tenant,
                plan_id: plan,
                provider_subscription_id: handle.into(),
                provider_customer_id: Some("cus_1".into()),
                checkout_session_id: None,
                state: ProviderState {
                    status: SubscriptionStatus::Active,
                    current_period_start: now,
                    current_period_end: now + time::Duration::days(30),
                    cancel_at_period_end: false,
                },
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn active_subscription_plan_wins() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let pro = store.add_plan("pro", 150_000, pro_limits());
        activate(&store, tenant, pro, "sub_pro").await;

        assert_eq!(catalog(&store).resolve_limits(tenant).await, pro_limits());
    }

    #[tokio::test]
    async fn no_subscription_uses_default_plan() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let custom = PlanLimits {
            max_chats_per_month: Some(3),
            ..PlanLimits::FALLBACK
        };
        store.add_plan("free", 0, custom);

        assert_eq!(catalog(&store).resolve_limits(tenant).await, custom);
    }

    #[tokio::test]
    async fn missing_default_plan_uses_built_in_limits() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        assert_eq!(
            catalog(&store).resolve_limits(tenant).await,
            PlanLimits::FALLBACK
        );
    }

    #[tokio::test]
    async fn storage_failure_still_resolves() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        store.set_fault(Fault::PlanReads, true);
        assert_eq!(
            catalog(&store).resolve_limits(tenant).await,
            PlanLimits::FALLBACK
        );
    }

    #[tokio::test]
    async fn create_defaults_currency_and_rejects_duplicates() {
        let store = Arc::new(InMemoryBillingStore::new());
        let plans = catalog(&store);
        let plan = plans
            .create(NewPlan {
                name: "Pro".into(),
                display_name: "Pro".into(),
                price_monthly_minor: 150_000,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(plan.name, "pro");
        assert_eq!(plan.currency, "IDR");

        let dup = plans
            .create(NewPlan {
                name: "pro".into(),
                display_name: "Pro again".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(dup, Err(BillingError::Conflict(_))));
    }

    #[tokio::test]
    async fn create_validates_input() {
        let plans = catalog(&Arc::new(InMemoryBillingStore::new()));
        let negative = plans
            .create(NewPlan {
                name: "x".into(),
                display_name: "X".into(),
                price_monthly_minor: -1,
                ..Default::default()
            })
            .await;
        assert!(matches!(negative, Err(BillingError::Validation(_))));

        let bad_currency = plans
            .create(NewPlan {
                name: "y".into(),
                display_name: "Y".into(),
                currency: Some("rupiah".into()),
                ..Default::default()
            })
            .await;
        assert!(matches!(bad_currency, Err(BillingError::Validation(_))));
    }

    #[tokio::test]
    async fn deactivate_refused_while_in_use() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let pro = store.add_plan("pro", 150_000, pro_limits());
        activate(&store, tenant, pro, "sub_pro").await;

        let plans = catalog(&store);
        assert!(matches!(
            plans.deactivate(pro).await,
            Err(BillingError::Conflict(_))
        ));

        let unused = store.add_plan("team", 300_000, pro_limits());
        assert!(!plans.deactivate(unused).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn find_accepts_id_or_name() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let pro = store.add_plan("pro", 150_000, pro_limits());
        let plans = catalog(&store);

        assert_eq!(plans.find("pro").await.unwrap().id, pro);
        assert_eq!(plans.find(&pro.to_string()).await.unwrap().name, "pro");
        assert!(matches!(
            plans.find("enterprise").await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn admin_listing_puts_stock_tiers_first() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        store.add_plan("team", 10, pro_limits());
        store.add_plan("enterprise", 1_000_000, pro_limits());
        store.add_plan("pro", 150_000, pro_limits());
        let plans = catalog(&store);

        let listed = plans.list(Page::default()).await.unwrap();
        let names: Vec<_> = listed.items.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["free", "pro", "enterprise", "team"]);
        assert_eq!(listed.total, 4);

        let active = plans.list_active().await.unwrap();
        let names: Vec<_> = active.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["free", "team", "pro", "enterprise"]);
    }
}
