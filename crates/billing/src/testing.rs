//! Test doubles shared with downstream crates' tests

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use billsync_shared::SubscriptionStatus;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::models::ProviderState;
use crate::provider::{
    CheckoutSession, NewCheckoutSession, NewCustomer, PaymentProvider, ProviderSubscription,
};
use crate::signature::sign;

#[derive(Default)]
struct FakeState {
    subscriptions: HashMap<String, ProviderSubscription>,
    customers: Vec<NewCustomer>,
    sessions: Vec<NewCheckoutSession>,
    fail_customers: bool,
    fail_sessions: bool,
    fail_retrievals: bool,
    counter: u32,
}

/// Scripted payment provider
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> BillingResult<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BillingError::ExternalProvider("fake provider poisoned".into()))?;
        Ok(f(&mut state))
    }

    pub fn put_subscription(&self, id: &str, customer_id: &str, state: ProviderState) {
        let _ = self.with(|s| {
            s.subscriptions.insert(
                id.to_string(),
                ProviderSubscription {
                    id: id.to_string(),
                    customer_id: Some(customer_id.to_string()),
                    state,
                },
            )
        });
    }

    pub fn fail_customers(&self, fail: bool) {
        let _ = self.with(|s| s.fail_customers = fail);
    }

    pub fn fail_sessions(&self, fail: bool) {
        let _ = self.with(|s| s.fail_sessions = fail);
    }

    pub fn fail_retrievals(&self, fail: bool) {
        let _ = self.with(|s| s.fail_retrievals = fail);
    }

    pub fn customers_created(&self) -> Vec<NewCustomer> {
        self.with(|s| s.customers.clone()).unwrap_or_default()
    }

    pub fn sessions_created(&self) -> Vec<NewCheckoutSession> {
        self.with(|s| s.sessions.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.with(|s| {
            if s.fail_retrievals {
                return Err(BillingError::ExternalProvider(
                    "retrieve subscription: connection reset".into(),
                ));
            }
            s.subscriptions.get(subscription_id).cloned().ok_or_else(|| {
                BillingError::ExternalProvider(format!("no such subscription: {subscription_id}"))
            })
        })?
    }

    async fn create_customer(&self, customer: &NewCustomer) -> BillingResult<String> {
        self.with(|s| {
            if s.fail_customers {
                return Err(BillingError::ExternalProvider(
                    "create customer: timed out after 15s".into(),
                ));
            }
            s.counter += 1;
            s.customers.push(customer.clone());
            Ok(format!("cus_fake{}", s.counter))
        })?
    }

    async fn create_checkout_session(
        &self,
        session: &NewCheckoutSession,
    ) -> BillingResult<CheckoutSession> {
        self.with(|s| {
            if s.fail_sessions {
                return Err(BillingError::ExternalProvider(
                    "create checkout session: card_declined".into(),
                ));
            }
            s.counter += 1;
            s.sessions.push(session.clone());
            let id = format!("cs_fake{}", s.counter);
            Ok(CheckoutSession {
                url: format!("https://checkout.example.test/{id}"),
                id,
            })
        })?
    }
}

/// A month-long period starting now with the given status
pub fn provider_state(status: SubscriptionStatus) -> ProviderState {
    let now = OffsetDateTime::now_utc();
    ProviderState {
        status,
        current_period_start: now,
        current_period_end: now + Duration::days(30),
        cancel_at_period_end: false,
    }
}

/// Serialize an event and sign it the way Stripe does, at the current time
pub fn signed_event(
    secret: &str,
    event_id: &str,
    kind: &str,
    object: serde_json::Value,
) -> (Vec<u8>, String) {
    let body = serde_json::json!({
        "id": event_id,
        "object": "event",
        "type": kind,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": object },
    })
    .to_string()
    .into_bytes();
    let header = sign(secret, OffsetDateTime::now_utc().unix_timestamp(), &body);
    (body, header)
}
