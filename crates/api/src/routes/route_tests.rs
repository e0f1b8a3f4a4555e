//! HTTP-level tests for the API router
//!
//! Tests cover:
//! - Webhook status codes (accepted, duplicate, rejected, redeliver)
//! - Checkout and quota endpoints
//! - Admin authentication and audited admin writes

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use billsync_billing::events::CHECKOUT_SESSION_COMPLETED;
use billsync_billing::models::{ActivityKind, PlanLimits};
use billsync_billing::store::Fault;
use billsync_billing::testing::{provider_state, signed_event, FakeProvider};
use billsync_billing::{
    BillingEmailService, BillingService, InMemoryBillingStore, StripeConfig,
};
use billsync_shared::{PlanId, SubscriptionStatus, TenantId};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;

use crate::routes::create_router;
use crate::state::AppState;

const SECRET: &str = "whsec_route_tests";
const ADMIN_TOKEN: &str = "admin-test-token";

struct TestApp {
    router: Router,
    store: Arc<InMemoryBillingStore>,
    provider: Arc<FakeProvider>,
    tenant: TenantId,
    plan: PlanId,
}

fn setup() -> TestApp {
    let store = Arc::new(InMemoryBillingStore::with_default_plan());
    let provider = Arc::new(FakeProvider::new());
    let tenant = store.add_tenant("Acme", "owner@acme.test");
    let plan = store.add_plan(
        "pro",
        150_000,
        PlanLimits {
            max_chats_per_month: Some(1000),
            max_file_uploads_per_month: Some(100),
            max_file_size_mb: None,
            max_forecast_refreshes_per_month: None,
        },
    );
    let billing = BillingService::from_parts(
        store.clone(),
        provider.clone(),
        BillingEmailService::disabled(),
        &StripeConfig::new("sk_test_123", SECRET),
        "free",
    );
    let state = AppState::from_parts(Arc::new(billing), Some(ADMIN_TOKEN));
    TestApp {
        router: create_router(state),
        store,
        provider,
        tenant,
        plan,
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn webhook_request(body: Vec<u8>, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/billing/webhook")
        .header("stripe-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

fn checkout_object(metadata: Value) -> Value {
    json!({
        "id": "cs_1",
        "object": "checkout.session",
        "subscription": "sub_1",
        "customer": "cus_1",
        "metadata": metadata,
    })
}

fn full_metadata(app: &TestApp) -> Value {
    json!({ "tenant_id": app.tenant.to_string(), "plan_id": app.plan.to_string() })
}

#[tokio::test]
async fn test_health() {
    let app = setup();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_webhook_applies_then_acknowledges_replay() {
    let app = setup();
    app.provider
        .put_subscription("sub_1", "cus_1", provider_state(SubscriptionStatus::Active));
    let (body, signature) = signed_event(
        SECRET,
        "evt_1",
        CHECKOUT_SESSION_COMPLETED,
        checkout_object(full_metadata(&app)),
    );

    let (status, first) = send(&app, webhook_request(body.clone(), &signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["type"], CHECKOUT_SESSION_COMPLETED);

    let (status, second) = send(&app, webhook_request(body, &signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);
    assert_eq!(app.store.subscriptions_for(app.tenant).len(), 1);
}

#[tokio::test]
async fn test_webhook_without_signature_is_rejected() {
    let app = setup();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/billing/webhook")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_signature");
}

#[tokio::test]
async fn test_webhook_missing_context_is_unprocessable() {
    let app = setup();
    let (body, signature) = signed_event(
        SECRET,
        "evt_ctx",
        CHECKOUT_SESSION_COMPLETED,
        checkout_object(json!({ "tenant_id": app.tenant.to_string() })),
    );
    let (status, _) = send(&app, webhook_request(body, &signature)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_webhook_provider_outage_asks_for_redelivery() {
    let app = setup();
    app.provider.fail_retrievals(true);
    let (body, signature) = signed_event(
        SECRET,
        "evt_down",
        CHECKOUT_SESSION_COMPLETED,
        checkout_object(full_metadata(&app)),
    );
    let (status, body) = send(&app, webhook_request(body, &signature)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!body["message"].as_str().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn test_checkout_returns_session_url() {
    let app = setup();
    let request = json_request(
        "POST",
        "/api/v1/billing/checkout",
        json!({
            "tenant_id": app.tenant,
            "plan_id": app.plan,
            "success_url": "https://app.example.test/ok",
            "cancel_url": "https://app.example.test/cancel",
        }),
    );
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let session_id = body["session_id"].as_str().unwrap();
    assert!(body["url"].as_str().unwrap().ends_with(session_id));
}

#[tokio::test]
async fn test_quota_check_reports_denial_reason() {
    let app = setup();
    let now = OffsetDateTime::now_utc();
    for _ in 0..5 {
        app.store.record_activity(app.tenant, ActivityKind::FileUpload, now);
    }

    let request = json_request(
        "POST",
        "/api/v1/quota/check",
        json!({ "tenant_id": app.tenant, "resource": "upload" }),
    );
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);
    assert!(body["reason"].as_str().unwrap().contains("5/5"));
}

#[tokio::test]
async fn test_quota_check_requires_size_for_file_checks() {
    let app = setup();
    let request = json_request(
        "POST",
        "/api/v1/quota/check",
        json!({ "tenant_id": app.tenant, "resource": "file_size" }),
    );
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_quota_failure_is_generic_unavailable() {
    let app = setup();
    app.store.set_fault(Fault::UsageQueries, true);
    let request = json_request(
        "POST",
        "/api/v1/quota/check",
        json!({ "tenant_id": app.tenant, "resource": "chat" }),
    );
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "quota_unavailable");
    assert!(!body["message"].as_str().unwrap().contains("injected"));
}

#[tokio::test]
async fn test_tenant_without_subscription_is_not_found() {
    let app = setup();
    let request = Request::builder()
        .uri(format!("/api/v1/billing/tenants/{}/subscription", app.tenant))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_usage_summary_includes_limits() {
    let app = setup();
    app.store
        .record_activity(app.tenant, ActivityKind::UserMessage, OffsetDateTime::now_utc());
    let request = Request::builder()
        .uri(format!("/api/v1/billing/tenants/{}/usage", app.tenant))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limits"]["max_chats_per_month"], 50);
    assert_eq!(body["usage"]["chats_this_month"], 1);
}

#[tokio::test]
async fn test_admin_routes_require_token() {
    let app = setup();
    let missing = Request::builder()
        .uri("/api/v1/admin/subscriptions")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, missing).await.0, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/api/v1/admin/subscriptions")
        .header("authorization", "Bearer not-the-token")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, wrong).await.0, StatusCode::UNAUTHORIZED);

    let (status, body) =
        send(&app, admin_request("GET", "/api/v1/admin/subscriptions", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn test_admin_subscription_lifecycle_is_audited() {
    let app = setup();
    let (status, created) = send(
        &app,
        admin_request(
            "POST",
            "/api/v1/admin/subscriptions",
            Some(json!({ "tenant_id": app.tenant, "plan": "pro" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "active");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        admin_request(
            "PUT",
            &format!("/api/v1/admin/subscriptions/{id}/status"),
            Some(json!({ "status": "canceled", "reason": "requested by customer" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        admin_request(
            "PUT",
            &format!("/api/v1/admin/subscriptions/{id}/status"),
            Some(json!({ "status": "active" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, history) = send(
        &app,
        admin_request(
            "GET",
            &format!("/api/v1/admin/subscriptions/{id}/transactions?limit=500"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["total"], 2);
    assert_eq!(history["limit"], 20);
    assert_eq!(history["items"][0]["kind"], "cancel");
}

#[tokio::test]
async fn test_admin_plan_crud() {
    let app = setup();
    let (status, plan) = send(
        &app,
        admin_request(
            "POST",
            "/api/v1/admin/plans",
            Some(json!({
                "name": "Team",
                "display_name": "Team",
                "price_monthly_minor": 300_000,
                "max_chats_per_month": 5000,
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(plan["name"], "team");
    assert_eq!(plan["currency"], "IDR");

    let (status, _) = send(
        &app,
        admin_request(
            "POST",
            "/api/v1/admin/plans",
            Some(json!({ "name": "team", "display_name": "Team", "price_monthly_minor": 1 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // A live subscription on pro blocks deactivation
    send(
        &app,
        admin_request(
            "POST",
            "/api/v1/admin/subscriptions",
            Some(json!({ "tenant_id": app.tenant, "plan": "pro" })),
        ),
    )
    .await;
    let (status, _) = send(
        &app,
        admin_request("DELETE", &format!("/api/v1/admin/plans/{}", app.plan), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let team_id = plan["id"].as_str().unwrap();
    let (status, deactivated) = send(
        &app,
        admin_request("DELETE", &format!("/api/v1/admin/plans/{team_id}"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deactivated["is_active"], false);
}
