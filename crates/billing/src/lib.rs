// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billsync Billing Module
//!
//! Keeps local subscription state in step with Stripe and enforces the
//! monthly quotas each plan grants.
//!
//! ## Features
//!
//! - **Checkout**: Start a hosted checkout for a tenant and plan
//! - **Webhooks**: Verify, dedupe and apply Stripe events
//! - **Subscription Management**: Admin status and plan changes with an audit trail
//! - **Plans**: Catalog of plans and their quota ceilings
//! - **Quotas**: Per-tenant monthly usage checks
//! - **Email Notifications**: Activation, past due, cancellation, receipts

use std::sync::Arc;

use sqlx::PgPool;

pub mod checkout;
pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod history;
pub mod models;
pub mod plans;
pub mod provider;
pub mod quota;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Checkout
pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult, Disposition, WriteClass};

// History
pub use history::SubscriptionHistory;

// Models
pub use models::{
    Actor, Page, Paginated, Plan, PlanLimits, Subscription, SubscriptionDetail,
    SubscriptionTransaction, TransactionKind,
};

// Plans
pub use plans::PlanCatalog;

// Provider
pub use provider::PaymentProvider;

// Quota
pub use quota::{QuotaDecision, QuotaEnforcer, Resource};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{
    ManualSubscriptionRequest, PlanChangeRequest, StatusChangeRequest, SubscriptionService,
};

// Usage
pub use usage::{UsageMeter, UsageStats};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

/// Name of the plan tenants fall back to when nothing else applies
pub const DEFAULT_PLAN_NAME: &str = "free";

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: Arc<dyn BillingStore>,
    pub checkout: CheckoutService,
    pub subscriptions: SubscriptionService,
    pub plans: PlanCatalog,
    pub usage: UsageMeter,
    pub quota: QuotaEnforcer,
    pub history: SubscriptionHistory,
    pub webhooks: WebhookHandler,
    pub email: BillingEmailService,
}

impl BillingService {
    /// Create the service backed by Postgres and the live Stripe API
    pub fn new(
        config: StripeConfig,
        pool: PgPool,
        email: BillingEmailService,
        default_plan_name: impl Into<String>,
    ) -> Self {
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
        let provider: Arc<dyn PaymentProvider> = Arc::new(StripeClient::new(config.clone()));
        Self::from_parts(store, provider, email, &config, default_plan_name)
    }

    /// Assemble the service from explicit store and provider implementations
    pub fn from_parts(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        email: BillingEmailService,
        config: &StripeConfig,
        default_plan_name: impl Into<String>,
    ) -> Self {
        let default_plan_name = default_plan_name.into();
        let plans = PlanCatalog::new(store.clone(), default_plan_name.clone());
        let usage = UsageMeter::new(store.clone());

        Self {
            checkout: CheckoutService::new(store.clone(), provider.clone()),
            subscriptions: SubscriptionService::new(store.clone(), plans.clone()),
            quota: QuotaEnforcer::new(plans.clone(), usage.clone()),
            history: SubscriptionHistory::new(store.clone()),
            webhooks: WebhookHandler::new(
                store.clone(),
                provider,
                email.clone(),
                config,
                default_plan_name,
            ),
            plans,
            usage,
            email,
            store,
        }
    }
}
