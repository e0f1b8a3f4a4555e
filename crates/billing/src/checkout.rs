//! Checkout session creation
//!
//! Nothing is written locally until the provider has accepted both the
//! customer and the session. The pending row recorded afterwards is replaced
//! by the real subscription when checkout completes.

use std::sync::Arc;

use billsync_shared::{PlanId, SubscriptionId, SubscriptionStatus, TenantId, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{best_effort, BillingError, BillingResult, WriteClass};
use crate::history::{AuditEntry, SubscriptionHistory};
use crate::models::{Actor, Subscription, TransactionKind};
use crate::provider::{NewCheckoutSession, NewCustomer, PaymentProvider};
use crate::store::BillingStore;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub success_url: String,
    pub cancel_url: String,
    /// Who asked for the checkout, if known
    #[serde(default, alias = "user_id")]
    pub requested_by: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub checkout_url: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    history: SubscriptionHistory,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn BillingStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self {
            history: SubscriptionHistory::new(store.clone()),
            store,
            provider,
        }
    }

    pub async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        validate_redirect("success_url", &request.success_url)?;
        validate_redirect("cancel_url", &request.cancel_url)?;

        let plan = self
            .store
            .get_plan(request.plan_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", request.plan_id)))?;
        let price_id = plan.provider_price_id.clone().ok_or_else(|| {
            BillingError::Validation(format!("plan '{}' has no provider price", plan.name))
        })?;
        let contact = self
            .store
            .tenant_contact(request.tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("tenant {}", request.tenant_id)))?;

        let customer_id = match self.store.find_customer_handle(request.tenant_id).await? {
            Some(existing) => existing,
            None => {
                self.provider
                    .create_customer(&NewCustomer {
                        tenant_id: request.tenant_id,
                        name: contact.name.clone(),
                        email: contact.owner_email.clone(),
                    })
                    .await?
            }
        };

        let session = self
            .provider
            .create_checkout_session(&NewCheckoutSession {
                customer_id: customer_id.clone(),
                price_id,
                success_url: request.success_url.clone(),
                cancel_url: request.cancel_url.clone(),
                tenant_id: request.tenant_id,
                plan_id: plan.id,
            })
            .await?;

        let now = OffsetDateTime::now_utc();
        let pending = Subscription {
            id: SubscriptionId::new(),
            tenant_id: request.tenant_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Incomplete,
            provider_subscription_id: None,
            provider_customer_id: Some(customer_id),
            checkout_session_id: Some(session.id.clone()),
            current_period_start: now,
            current_period_end: now,
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        };

        let recorded = best_effort(
            WriteClass::Secondary,
            "pending checkout subscription",
            self.store.insert_subscription(&pending).await,
        )?;
        if recorded.is_some() {
            let actor = request.requested_by.map(Actor::User).unwrap_or(Actor::System);
            self.history
                .record(
                    WriteClass::Secondary,
                    AuditEntry::new(&pending, TransactionKind::Create, actor).metadata(
                        serde_json::json!({
                            "source": "checkout",
                            "checkout_session_id": session.id,
                        }),
                    ),
                )
                .await?;
        }

        tracing::info!(
            tenant_id = %request.tenant_id,
            plan = %plan.name,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id,
            checkout_url: session.url,
        })
    }
}

fn validate_redirect(field: &str, url: &str) -> BillingResult<()> {
    let url = url.trim();
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(BillingError::Validation(format!(
            "{field} must be an absolute http(s) URL"
        )))
    }
}
