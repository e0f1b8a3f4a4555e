//! Platform admin routes
//!
//! Protected by [`crate::auth::require_admin`]. Every state change made here
//! is written to the subscription audit log with the acting admin.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use billsync_billing::{
    models::{NewPlan, PlanUpdate},
    ManualSubscriptionRequest, Paginated, Plan, PlanChangeRequest, StatusChangeRequest,
    Subscription, SubscriptionDetail, SubscriptionTransaction,
};
use billsync_shared::{PlanId, SubscriptionId, SubscriptionStatus};
use serde::Serialize;

use crate::{auth::AdminActor, error::ApiResult, routes::PageQuery, state::AppState};

// =============================================================================
// Subscriptions
// =============================================================================

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Paginated<SubscriptionDetail>>> {
    Ok(Json(state.billing.subscriptions.list(query.into()).await?))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> ApiResult<Json<SubscriptionDetail>> {
    Ok(Json(state.billing.subscriptions.get(id).await?))
}

#[derive(Debug, Serialize)]
pub struct CreatedSubscription {
    pub id: SubscriptionId,
    pub status: SubscriptionStatus,
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(AdminActor(actor)): Extension<AdminActor>,
    Json(request): Json<ManualSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<CreatedSubscription>)> {
    let sub = state
        .billing
        .subscriptions
        .create_manual(request, actor)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedSubscription {
            id: sub.id,
            status: sub.status,
        }),
    ))
}

pub async fn update_subscription_status(
    State(state): State<AppState>,
    Extension(AdminActor(actor)): Extension<AdminActor>,
    Path(id): Path<SubscriptionId>,
    Json(request): Json<StatusChangeRequest>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(
        state
            .billing
            .subscriptions
            .update_status(id, request, actor)
            .await?,
    ))
}

pub async fn update_subscription_plan(
    State(state): State<AppState>,
    Extension(AdminActor(actor)): Extension<AdminActor>,
    Path(id): Path<SubscriptionId>,
    Json(request): Json<PlanChangeRequest>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(
        state
            .billing
            .subscriptions
            .change_plan(id, request, actor)
            .await?,
    ))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Paginated<SubscriptionTransaction>>> {
    Ok(Json(
        state
            .billing
            .subscriptions
            .transactions(id, query.into())
            .await?,
    ))
}

// =============================================================================
// Plans
// =============================================================================

pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Paginated<Plan>>> {
    Ok(Json(state.billing.plans.list(query.into()).await?))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<PlanId>,
) -> ApiResult<Json<Plan>> {
    Ok(Json(state.billing.plans.get(id).await?))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(new): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    let plan = state.billing.plans.create(new).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Path(id): Path<PlanId>,
    Json(update): Json<PlanUpdate>,
) -> ApiResult<Json<Plan>> {
    Ok(Json(state.billing.plans.update(id, update).await?))
}

/// Soft delete: the plan stays for existing references but leaves the catalogue
pub async fn deactivate_plan(
    State(state): State<AppState>,
    Path(id): Path<PlanId>,
) -> ApiResult<Json<Plan>> {
    Ok(Json(state.billing.plans.deactivate(id).await?))
}
