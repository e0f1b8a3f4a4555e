//! API error type and its HTTP mapping
//!
//! Client errors carry a message the caller can act on. Server-side failures
//! are logged here and answered with a generic body so provider and storage
//! details never reach the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use billsync_billing::{BillingError, Disposition};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Quota service unavailable")]
    QuotaUnavailable,
    /// Failure that may succeed on retry; the message stays server-side
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
            ),
            ApiError::InvalidSignature => (
                StatusCode::BAD_REQUEST,
                "invalid_signature",
                self.to_string(),
            ),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.clone()),
            ApiError::Validation(m) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_failed",
                m.clone(),
            ),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m.clone()),
            ApiError::QuotaUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "quota_unavailable",
                "Unable to verify your usage right now. Please try again shortly.".to_string(),
            ),
            ApiError::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily_unavailable",
                "Service temporarily unavailable".to_string(),
            ),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidSignature => ApiError::InvalidSignature,
            BillingError::InvalidPayload(m) => ApiError::BadRequest(format!("Invalid payload: {m}")),
            BillingError::MissingContext(m) => {
                ApiError::Validation(format!("Event is missing required context: {m}"))
            }
            BillingError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            e @ BillingError::InvalidTransition { .. } => ApiError::Validation(e.to_string()),
            BillingError::Validation(m) => ApiError::Validation(m),
            BillingError::Conflict(m) => ApiError::Conflict(m),
            BillingError::EventInFlight(_) => {
                ApiError::Conflict("Event is already being processed".to_string())
            }
            e => match e.disposition() {
                Disposition::Transient => ApiError::Unavailable(e.to_string()),
                Disposition::Permanent => ApiError::Internal(e.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        match &self {
            ApiError::Unavailable(detail) | ApiError::Internal(detail) => {
                tracing::error!(status = status.as_u16(), error = %detail, "Request failed");
            }
            _ if status.is_client_error() => {
                tracing::debug!(status = status.as_u16(), error = %message, "Request rejected");
            }
            _ => {}
        }

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: BillingError) -> StatusCode {
        ApiError::from(err).parts().0
    }

    #[test]
    fn webhook_rejections_map_to_client_errors() {
        assert_eq!(status_of(BillingError::InvalidSignature), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(BillingError::InvalidPayload("not json".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::MissingContext("metadata.plan_id is absent".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(BillingError::EventInFlight("evt_1".into())),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn transient_failures_ask_for_redelivery() {
        assert_eq!(
            status_of(BillingError::ExternalProvider("timed out".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::Storage("connection refused".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::Config("missing key".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn server_errors_hide_details() {
        let (_, _, message) =
            ApiError::from(BillingError::Storage("password authentication failed".into())).parts();
        assert!(!message.contains("password"));
    }
}
