//! Quota check endpoint called by chat, upload and forecast features

use axum::{extract::State, Json};
use billsync_billing::{BillingError, QuotaDecision, Resource};
use billsync_shared::TenantId;
use serde::Deserialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct QuotaCheckRequest {
    pub tenant_id: TenantId,
    pub resource: Resource,
    /// Candidate file size, only read for `file_size`
    #[serde(default)]
    pub size_bytes: Option<i64>,
}

pub async fn check_quota(
    State(state): State<AppState>,
    Json(request): Json<QuotaCheckRequest>,
) -> ApiResult<Json<QuotaDecision>> {
    let decision = state
        .billing
        .quota
        .check(request.tenant_id, request.resource, request.size_bytes)
        .await
        .map_err(|e| match e {
            BillingError::Validation(_) => ApiError::from(e),
            e => {
                tracing::error!(
                    tenant_id = %request.tenant_id,
                    resource = ?request.resource,
                    error = %e,
                    "Quota check failed"
                );
                ApiError::QuotaUnavailable
            }
        })?;

    if !decision.allowed {
        tracing::info!(
            tenant_id = %request.tenant_id,
            resource = ?request.resource,
            "Quota denied"
        );
    }
    Ok(Json(decision))
}
