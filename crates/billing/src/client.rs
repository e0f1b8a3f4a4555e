//! Stripe client wrapper

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use billsync_shared::SubscriptionStatus;
use stripe::{
    CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CreateCustomer, Customer, CustomerId, StripeError,
    Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus,
};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::ProviderState;
use crate::provider::{
    CheckoutSession, NewCheckoutSession, NewCustomer, PaymentProvider, ProviderSubscription,
    META_TENANT_ID,
};

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Maximum age of a signed webhook timestamp
    pub webhook_tolerance: Duration,
    /// Upper bound on any single provider call
    pub request_timeout: Duration,
}

impl StripeConfig {
    pub const DEFAULT_WEBHOOK_TOLERANCE: Duration = Duration::from_secs(300);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            webhook_tolerance: Self::DEFAULT_WEBHOOK_TOLERANCE,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Load from `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET`,
    /// `STRIPE_WEBHOOK_TOLERANCE_SECS` and `PROVIDER_TIMEOUT_SECS`
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
            webhook_tolerance: secs_from_env("STRIPE_WEBHOOK_TOLERANCE_SECS")?
                .unwrap_or(Self::DEFAULT_WEBHOOK_TOLERANCE),
            request_timeout: secs_from_env("PROVIDER_TIMEOUT_SECS")?
                .unwrap_or(Self::DEFAULT_REQUEST_TIMEOUT),
        })
    }
}

fn secs_from_env(key: &str) -> BillingResult<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| BillingError::Config(format!("{key} must be a whole number of seconds"))),
        Err(_) => Ok(None),
    }
}

/// Stripe API client. Every call is bounded by `request_timeout`.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(&config.secret_key);
        Self { inner, config }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, op: &str, call: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, StripeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(op = %op, error = %e, "Stripe call failed");
                Err(BillingError::ExternalProvider(format!("{op}: {e}")))
            }
            Err(_) => {
                tracing::error!(
                    op = %op,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Stripe call timed out"
                );
                Err(BillingError::ExternalProvider(format!(
                    "{op}: timed out after {}s",
                    self.config.request_timeout.as_secs()
                )))
            }
        }
    }
}

fn local_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid | StripeSubStatus::Paused => {
            SubscriptionStatus::PastDue
        }
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
    }
}

fn timestamp(secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| BillingError::ExternalProvider(format!("invalid timestamp {secs}: {e}")))
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let id = subscription_id.parse::<SubscriptionId>().map_err(|e| {
            BillingError::InvalidPayload(format!("bad subscription id '{subscription_id}': {e}"))
        })?;

        let sub = self
            .bounded(
                "retrieve subscription",
                Subscription::retrieve(&self.inner, &id, &[]),
            )
            .await?;

        let customer_id = match &sub.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        Ok(ProviderSubscription {
            id: sub.id.to_string(),
            customer_id: Some(customer_id),
            state: ProviderState {
                status: local_status(sub.status),
                current_period_start: timestamp(sub.current_period_start)?,
                current_period_end: timestamp(sub.current_period_end)?,
                cancel_at_period_end: sub.cancel_at_period_end,
            },
        })
    }

    async fn create_customer(&self, customer: &NewCustomer) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert(META_TENANT_ID.to_string(), customer.tenant_id.to_string());

        let mut params = CreateCustomer::new();
        params.email = Some(&customer.email);
        params.name = Some(&customer.name);
        params.metadata = Some(metadata);

        let created = self
            .bounded("create customer", Customer::create(&self.inner, params))
            .await?;

        tracing::info!(
            tenant_id = %customer.tenant_id,
            customer_id = %created.id,
            "Created Stripe customer"
        );
        Ok(created.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        session: &NewCheckoutSession,
    ) -> BillingResult<CheckoutSession> {
        let customer_id = session.customer_id.parse::<CustomerId>().map_err(|e| {
            BillingError::ExternalProvider(format!(
                "bad customer id '{}': {e}",
                session.customer_id
            ))
        })?;
        let metadata = session.metadata();

        let params = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(session.price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&session.success_url),
            cancel_url: Some(&session.cancel_url),
            metadata: Some(metadata.clone()),
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .bounded(
                "create checkout session",
                stripe::CheckoutSession::create(&self.inner, params),
            )
            .await?;

        let url = created.url.clone().ok_or_else(|| {
            BillingError::ExternalProvider("checkout session has no redirect URL".into())
        })?;

        Ok(CheckoutSession {
            id: created.id.to_string(),
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_only_states_fold_locally() {
        assert_eq!(
            local_status(StripeSubStatus::Unpaid),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            local_status(StripeSubStatus::IncompleteExpired),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            local_status(StripeSubStatus::Trialing),
            SubscriptionStatus::Trialing
        );
    }

    #[test]
    fn config_defaults() {
        let config = StripeConfig::new("sk_test", "whsec_test");
        assert_eq!(config.webhook_tolerance, Duration::from_secs(300));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
    }
}
