//! Billing routes: webhook intake, checkout, plan listing, tenant summaries

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use billsync_billing::{
    BillingStore, CheckoutRequest, Plan, PlanLimits, SubscriptionDetail, UsageStats,
    WebhookOutcome,
};
use billsync_shared::TenantId;
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Stripe webhook endpoint
///
/// Any 2xx tells Stripe to stop redelivering, so only outcomes that are safe
/// to drop answer 200. Errors go through [`ApiError`], which keeps transient
/// failures on 5xx.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without Stripe-Signature header");
            ApiError::InvalidSignature
        })?;

    let outcome = state.billing.webhooks.process(&body, signature).await?;

    let body = match outcome {
        WebhookOutcome::Applied { kind } => json!({ "received": true, "type": kind }),
        WebhookOutcome::Ignored { kind, reason } => {
            json!({ "received": true, "type": kind, "ignored": reason })
        }
        WebhookOutcome::Duplicate => json!({ "received": true, "duplicate": true }),
    };
    Ok(Json(body))
}

#[derive(Debug, Serialize)]
pub struct CheckoutSessionResponse {
    pub session_id: String,
    pub url: String,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutSessionResponse>> {
    let session = state
        .billing
        .checkout
        .create_checkout_session(request)
        .await?;

    Ok(Json(CheckoutSessionResponse {
        session_id: session.session_id,
        url: session.checkout_url,
    }))
}

/// Active plans, cheapest first
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.billing.plans.list_active().await?))
}

pub async fn current_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> ApiResult<Json<SubscriptionDetail>> {
    state
        .billing
        .subscriptions
        .current_for_tenant(tenant_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No active subscription".to_string()))
}

#[derive(Debug, Serialize)]
pub struct UsageSummary {
    pub limits: PlanLimits,
    pub usage: UsageStats,
}

pub async fn usage_summary(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> ApiResult<Json<UsageSummary>> {
    if state.billing.store.get_tenant(tenant_id).await?.is_none() {
        return Err(ApiError::NotFound("Tenant not found".to_string()));
    }

    let (limits, usage) = tokio::join!(
        state.billing.plans.resolve_limits(tenant_id),
        state.billing.usage.stats(tenant_id)
    );

    Ok(Json(UsageSummary {
        limits,
        usage: usage?,
    }))
}
