//! Application state

use std::sync::Arc;

use billsync_billing::{BillingEmailService, BillingService};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// Admin bearer token; `None` locks the admin routes
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        let email = BillingEmailService::new(config.email.clone());
        if email.is_enabled() {
            tracing::info!("Billing notification mail enabled");
        } else {
            tracing::warn!("Billing notification mail not configured (missing MAIL_API_URL)");
        }

        let billing = BillingService::new(
            config.stripe.clone(),
            pool,
            email,
            config.default_plan_name.clone(),
        );
        tracing::info!(
            default_plan = %config.default_plan_name,
            "Stripe billing service initialized"
        );

        if config.admin_api_token.is_none() {
            tracing::warn!("ADMIN_API_TOKEN not set, admin routes will reject every request");
        }

        Self::from_parts(Arc::new(billing), config.admin_api_token.as_deref())
    }

    /// Build state around an already assembled billing service
    pub fn from_parts(billing: Arc<BillingService>, admin_token: Option<&str>) -> Self {
        Self {
            billing,
            admin_token: admin_token.map(Arc::from),
        }
    }
}
