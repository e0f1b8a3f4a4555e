//! Quota enforcement
//!
//! Answers "may this tenant do X right now" from the plan limits and the
//! current month's usage. Evaluation is advisory: two concurrent checks can
//! both be allowed at `limit - 1`.

use std::sync::Arc;

use billsync_shared::TenantId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::ActivityKind;
use crate::plans::PlanCatalog;
use crate::usage::UsageMeter;

const BYTES_PER_MB: i64 = 1024 * 1024;

/// Quota-controlled resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Chat,
    Upload,
    FileSize,
    Forecast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl QuotaDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    plans: PlanCatalog,
    usage: UsageMeter,
}

impl QuotaEnforcer {
    pub fn new(plans: PlanCatalog, usage: UsageMeter) -> Self {
        Self { plans, usage }
    }

    /// Dispatch on `resource`. `size_bytes` is required for [`Resource::FileSize`]
    /// and ignored otherwise.
    pub async fn check(
        &self,
        tenant_id: TenantId,
        resource: Resource,
        size_bytes: Option<i64>,
    ) -> BillingResult<QuotaDecision> {
        match resource {
            Resource::Chat => self.check_chat(tenant_id).await,
            Resource::Upload => self.check_upload(tenant_id).await,
            Resource::FileSize => {
                let size_bytes = size_bytes.ok_or_else(|| {
                    BillingError::Validation("size_bytes is required for file_size checks".into())
                })?;
                self.check_file_size(tenant_id, size_bytes).await
            }
            Resource::Forecast => self.check_forecast(tenant_id).await,
        }
    }

    pub async fn check_chat(&self, tenant_id: TenantId) -> BillingResult<QuotaDecision> {
        let limits = self.plans.resolve_limits(tenant_id).await;
        let Some(limit) = limits.max_chats_per_month else {
            return Ok(QuotaDecision::allow());
        };
        let used = self.used(tenant_id, ActivityKind::UserMessage).await?;
        Ok(if used < i64::from(limit) {
            QuotaDecision::allow()
        } else {
            QuotaDecision::deny(format!(
                "Chat limit reached ({used}/{limit} messages this month). Upgrade your plan for more."
            ))
        })
    }

    pub async fn check_upload(&self, tenant_id: TenantId) -> BillingResult<QuotaDecision> {
        let limits = self.plans.resolve_limits(tenant_id).await;
        let Some(limit) = limits.max_file_uploads_per_month else {
            return Ok(QuotaDecision::allow());
        };
        let used = self.used(tenant_id, ActivityKind::FileUpload).await?;
        Ok(if used < i64::from(limit) {
            QuotaDecision::allow()
        } else {
            QuotaDecision::deny(format!(
                "Upload limit reached ({used}/{limit} files this month). Upgrade your plan for more."
            ))
        })
    }

    /// Stateless: compares against the plan's per-file ceiling only
    pub async fn check_file_size(
        &self,
        tenant_id: TenantId,
        size_bytes: i64,
    ) -> BillingResult<QuotaDecision> {
        if size_bytes < 0 {
            return Err(BillingError::Validation(
                "size_bytes must be a non-negative integer".into(),
            ));
        }
        let limits = self.plans.resolve_limits(tenant_id).await;
        let Some(limit_mb) = limits.max_file_size_mb else {
            return Ok(QuotaDecision::allow());
        };
        let max_bytes = i64::from(limit_mb).saturating_mul(BYTES_PER_MB);
        Ok(if size_bytes <= max_bytes {
            QuotaDecision::allow()
        } else {
            QuotaDecision::deny(format!(
                "File size exceeds limit ({limit_mb} MB max). Upgrade your plan for larger files."
            ))
        })
    }

    pub async fn check_forecast(&self, tenant_id: TenantId) -> BillingResult<QuotaDecision> {
        let limits = self.plans.resolve_limits(tenant_id).await;
        let Some(limit) = limits.max_forecast_refreshes_per_month else {
            return Ok(QuotaDecision::allow());
        };
        let used = self.used(tenant_id, ActivityKind::Forecast).await?;
        Ok(if used < i64::from(limit) {
            QuotaDecision::allow()
        } else {
            QuotaDecision::deny(format!(
                "Forecast refresh limit reached ({used}/{limit} this month). Upgrade your plan for more."
            ))
        })
    }

    async fn used(&self, tenant_id: TenantId, kind: ActivityKind) -> BillingResult<i64> {
        self.usage
            .count_at(tenant_id, kind, OffsetDateTime::now_utc())
            .await
            .inspect_err(|e| {
                tracing::error!(
                    tenant_id = %tenant_id,
                    kind = ?kind,
                    error = %e,
                    "Failed to count usage for quota check"
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanLimits;
    use crate::store::{Fault, InMemoryBillingStore};

    fn enforcer(store: &Arc<InMemoryBillingStore>) -> QuotaEnforcer {
        QuotaEnforcer::new(
            PlanCatalog::new(store.clone(), "free"),
            UsageMeter::new(store.clone()),
        )
    }

    fn record(store: &InMemoryBillingStore, tenant: TenantId, kind: ActivityKind, n: usize) {
        for _ in 0..n {
            store.record_activity(tenant, kind, OffsetDateTime::now_utc());
        }
    }

    #[tokio::test]
    async fn chat_denied_exactly_at_limit() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let quota = enforcer(&store);

        record(&store, tenant, ActivityKind::UserMessage, 49);
        assert!(quota.check_chat(tenant).await.unwrap().allowed);

        record(&store, tenant, ActivityKind::UserMessage, 1);
        let denied = quota.check_chat(tenant).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(
            denied.reason.as_deref(),
            Some("Chat limit reached (50/50 messages this month). Upgrade your plan for more.")
        );
    }

    #[tokio::test]
    async fn upload_and_forecast_messages() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let quota = enforcer(&store);

        record(&store, tenant, ActivityKind::FileUpload, 5);
        record(&store, tenant, ActivityKind::Forecast, 10);

        assert_eq!(
            quota.check_upload(tenant).await.unwrap().reason.as_deref(),
            Some("Upload limit reached (5/5 files this month). Upgrade your plan for more.")
        );
        assert_eq!(
            quota.check_forecast(tenant).await.unwrap().reason.as_deref(),
            Some("Forecast refresh limit reached (10/10 this month). Upgrade your plan for more.")
        );
    }

    #[tokio::test]
    async fn file_size_boundary_is_inclusive() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let quota = enforcer(&store);

        let five_mb = 5 * 1024 * 1024;
        assert!(quota.check_file_size(tenant, five_mb).await.unwrap().allowed);

        let over = quota.check_file_size(tenant, five_mb + 1).await.unwrap();
        assert!(!over.allowed);
        assert_eq!(
            over.reason.as_deref(),
            Some("File size exceeds limit (5 MB max). Upgrade your plan for larger files.")
        );
    }

    #[tokio::test]
    async fn file_size_check_requires_a_valid_size() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.add_plan("free", 0, PlanLimits::default());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let quota = enforcer(&store);

        // Even an unlimited plan does not turn a missing size into an allow
        assert!(matches!(
            quota.check(tenant, Resource::FileSize, None).await,
            Err(BillingError::Validation(_))
        ));
        assert!(matches!(
            quota.check(tenant, Resource::FileSize, Some(-1)).await,
            Err(BillingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unlimited_plan_always_allows() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.add_plan("free", 0, PlanLimits::default());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        record(&store, tenant, ActivityKind::UserMessage, 10_000);

        let quota = enforcer(&store);
        for resource in [Resource::Chat, Resource::Upload, Resource::Forecast] {
            assert!(quota.check(tenant, resource, None).await.unwrap().allowed);
        }
        assert!(
            quota
                .check(tenant, Resource::FileSize, Some(i64::MAX))
                .await
                .unwrap()
                .allowed
        );
    }

    #[tokio::test]
    async fn unlimited_check_skips_usage_query() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.add_plan("free", 0, PlanLimits::default());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        store.set_fault(Fault::UsageQueries, true);

        assert!(enforcer(&store).check_chat(tenant).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn usage_failure_is_an_error_not_a_decision() {
        let store = Arc::new(InMemoryBillingStore::with_default_plan());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        store.set_fault(Fault::UsageQueries, true);

        let result = enforcer(&store).check_chat(tenant).await;
        assert!(matches!(result, Err(BillingError::Storage(_))));
    }

    #[tokio::test]
    async fn zero_limit_denies_first_use() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.add_plan(
            "free",
            0,
            PlanLimits {
                max_forecast_refreshes_per_month: Some(0),
                ..PlanLimits::FALLBACK
            },
        );
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        assert!(!enforcer(&store).check_forecast(tenant).await.unwrap().allowed);
    }
}
