//! Admin authentication middleware for Axum
//!
//! Admin routes are guarded by a single static bearer token. Session issuance
//! lives elsewhere; callers may name the acting user in `X-Admin-User` so the
//! audit log can attribute the change.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use billsync_billing::Actor;
use billsync_shared::UserId;
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

pub const ADMIN_USER_HEADER: &str = "x-admin-user";

/// Who is acting on an admin request, inserted into request extensions
#[derive(Debug, Clone, Copy)]
pub struct AdminActor(pub Actor);

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
}

fn token_matches(expected: &str, presented: &str) -> bool {
    // Length differences still leak, token contents do not
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let authorized = match (state.admin_token.as_deref(), extract_bearer_token(&request)) {
        (Some(expected), Some(presented)) => token_matches(expected, presented),
        _ => false,
    };
    if !authorized {
        tracing::warn!(path = %path, "Rejected admin request");
        return ApiError::Unauthorized.into_response();
    }

    let actor = request
        .headers()
        .get(ADMIN_USER_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.parse::<UserId>().ok())
        .map(Actor::User)
        .unwrap_or(Actor::System);
    request.extensions_mut().insert(AdminActor(actor));

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison_is_exact() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cret", "s3cret2"));
        assert!(!token_matches("s3cret", "S3cret"));
        assert!(!token_matches("s3cret", ""));
    }
}
