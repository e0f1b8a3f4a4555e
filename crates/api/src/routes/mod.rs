//! HTTP routes

use axum::{
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use billsync_billing::Page;

use crate::{auth::require_admin, state::AppState};

pub mod admin;
pub mod billing;
pub mod quota;

#[cfg(test)]
mod route_tests;

/// `?page=&limit=` query, normalised through [`Page::new`]
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl From<PageQuery> for Page {
    fn from(q: PageQuery) -> Self {
        Page::new(q.page, q.limit)
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/subscriptions",
            get(admin::list_subscriptions).post(admin::create_subscription),
        )
        .route("/subscriptions/{id}", get(admin::get_subscription))
        .route(
            "/subscriptions/{id}/status",
            put(admin::update_subscription_status),
        )
        .route(
            "/subscriptions/{id}/plan",
            put(admin::update_subscription_plan),
        )
        .route(
            "/subscriptions/{id}/transactions",
            get(admin::list_transactions),
        )
        .route("/plans", get(admin::list_plans).post(admin::create_plan))
        .route(
            "/plans/{id}",
            get(admin::get_plan)
                .put(admin::update_plan)
                .delete(admin::deactivate_plan),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let billing_routes = Router::new()
        .route("/webhook", post(billing::stripe_webhook))
        .route("/checkout", post(billing::create_checkout))
        .route("/plans", get(billing::list_plans))
        .route(
            "/tenants/{id}/subscription",
            get(billing::current_subscription),
        )
        .route("/tenants/{id}/usage", get(billing::usage_summary));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/billing", billing_routes)
        .route("/api/v1/quota/check", post(quota::check_quota))
        .nest("/api/v1/admin", admin_routes)
        .with_state(state)
}
