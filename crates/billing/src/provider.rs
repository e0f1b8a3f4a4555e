//! Payment-provider seam
//!
//! Services only talk to the provider through [`PaymentProvider`]. The
//! production implementation is [`crate::client::StripeClient`].

use async_trait::async_trait;
use billsync_shared::{PlanId, TenantId};

use crate::error::BillingResult;
use crate::models::ProviderState;

/// Metadata keys written on checkout sessions and their subscriptions
pub const META_TENANT_ID: &str = "tenant_id";
pub const META_PLAN_ID: &str = "plan_id";

/// Subscription as reported by the provider
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub state: ProviderState,
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub tenant_id: TenantId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct NewCheckoutSession {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
}

impl NewCheckoutSession {
    /// Attached to both the session and the subscription it creates
    pub fn metadata(&self) -> std::collections::HashMap<String, String> {
        [
            (META_TENANT_ID.to_string(), self.tenant_id.to_string()),
            (META_PLAN_ID.to_string(), self.plan_id.to_string()),
        ]
        .into_iter()
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<ProviderSubscription>;

    /// Returns the new customer handle
    async fn create_customer(&self, customer: &NewCustomer) -> BillingResult<String>;

    async fn create_checkout_session(
        &self,
        session: &NewCheckoutSession,
    ) -> BillingResult<CheckoutSession>;
}
