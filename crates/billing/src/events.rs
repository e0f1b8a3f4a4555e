//! Typed provider events
//!
//! A verified payload is first read as an [`EventEnvelope`] (enough to claim
//! the ledger entry), then converted into a [`ProviderEvent`]. Conversion is
//! the single place payload fields are validated; handlers only ever see
//! typed values.

use std::collections::HashMap;

use billsync_shared::{PlanId, SubscriptionStatus, TenantId};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::ProviderState;
use crate::provider::{META_PLAN_ID, META_TENANT_ID};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

/// Outer shape shared by every event
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl EventEnvelope {
    pub fn parse(payload: &[u8]) -> BillingResult<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(payload)?;
        if envelope.id.trim().is_empty() {
            return Err(BillingError::InvalidPayload("event id is empty".into()));
        }
        Ok(envelope)
    }
}

/// Tenant and plan carried in checkout metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutContext {
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
}

#[derive(Debug, Clone)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub context: CheckoutContext,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub state: ProviderState,
    /// Present when the subscription was created through our checkout
    pub context: Option<CheckoutContext>,
}

#[derive(Debug, Clone)]
pub struct InvoiceSnapshot {
    pub invoice_id: String,
    pub subscription_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub amount_paid_minor: i64,
    pub currency: String,
    pub billing_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionCreated(SubscriptionSnapshot),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    PaymentSucceeded(InvoiceSnapshot),
    PaymentFailed(InvoiceSnapshot),
    /// Recognised envelope, kind this system does not act on
    Unhandled(String),
}

impl ProviderEvent {
    pub fn kind(&self) -> &str {
        match self {
            ProviderEvent::CheckoutCompleted(_) => CHECKOUT_SESSION_COMPLETED,
            ProviderEvent::SubscriptionCreated(_) => SUBSCRIPTION_CREATED,
            ProviderEvent::SubscriptionUpdated(_) => SUBSCRIPTION_UPDATED,
            ProviderEvent::SubscriptionDeleted(_) => SUBSCRIPTION_DELETED,
            ProviderEvent::PaymentSucceeded(_) => INVOICE_PAYMENT_SUCCEEDED,
            ProviderEvent::PaymentFailed(_) => INVOICE_PAYMENT_FAILED,
            ProviderEvent::Unhandled(kind) => kind,
        }
    }
}

impl TryFrom<&EventEnvelope> for ProviderEvent {
    type Error = BillingError;

    fn try_from(envelope: &EventEnvelope) -> BillingResult<Self> {
        let object = &envelope.data.object;
        Ok(match envelope.kind.as_str() {
            CHECKOUT_SESSION_COMPLETED => ProviderEvent::CheckoutCompleted(checkout(object)?),
            SUBSCRIPTION_CREATED => ProviderEvent::SubscriptionCreated(subscription(object)?),
            SUBSCRIPTION_UPDATED => ProviderEvent::SubscriptionUpdated(subscription(object)?),
            SUBSCRIPTION_DELETED => ProviderEvent::SubscriptionDeleted(subscription(object)?),
            INVOICE_PAYMENT_SUCCEEDED => ProviderEvent::PaymentSucceeded(invoice(object)?),
            INVOICE_PAYMENT_FAILED => ProviderEvent::PaymentFailed(invoice(object)?),
            other => ProviderEvent::Unhandled(other.to_string()),
        })
    }
}

// =============================================================================
// Raw object shapes
// =============================================================================

/// A reference that is either a bare id or an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Reference {
    Id(String),
    Object { id: String },
}

impl Reference {
    fn into_id(self) -> String {
        match self {
            Reference::Id(id) | Reference::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RawCheckoutSession {
    id: String,
    subscription: Option<Reference>,
    customer: Option<Reference>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    customer: Option<Reference>,
    status: String,
    current_period_start: i64,
    current_period_end: i64,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    subscription: Option<Reference>,
    payment_intent: Option<Reference>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    currency: String,
    billing_reason: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(object: &serde_json::Value) -> BillingResult<T> {
    T::deserialize(object).map_err(|e| BillingError::InvalidPayload(e.to_string()))
}

fn metadata_id<T: std::str::FromStr>(
    metadata: &HashMap<String, String>,
    key: &str,
) -> BillingResult<T> {
    let raw = metadata
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::MissingContext(format!("metadata.{key} is absent")))?;
    raw.parse()
        .map_err(|_| BillingError::MissingContext(format!("metadata.{key} is not a valid id")))
}

fn context(metadata: &HashMap<String, String>) -> BillingResult<CheckoutContext> {
    Ok(CheckoutContext {
        tenant_id: metadata_id(metadata, META_TENANT_ID)?,
        plan_id: metadata_id(metadata, META_PLAN_ID)?,
    })
}

fn unix(secs: i64, field: &str) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|_| BillingError::InvalidPayload(format!("{field} is out of range")))
}

fn checkout(object: &serde_json::Value) -> BillingResult<CheckoutCompleted> {
    let raw: RawCheckoutSession = decode(object)?;
    let context = context(&raw.metadata)?;
    let subscription_id = raw
        .subscription
        .map(Reference::into_id)
        .ok_or_else(|| BillingError::MissingContext("session has no subscription".into()))?;

    Ok(CheckoutCompleted {
        session_id: raw.id,
        subscription_id,
        customer_id: raw.customer.map(Reference::into_id),
        context,
    })
}

fn subscription(object: &serde_json::Value) -> BillingResult<SubscriptionSnapshot> {
    let raw: RawSubscription = decode(object)?;
    let status = SubscriptionStatus::from_provider(&raw.status).ok_or_else(|| {
        BillingError::InvalidPayload(format!("unknown subscription status '{}'", raw.status))
    })?;

    Ok(SubscriptionSnapshot {
        subscription_id: raw.id,
        customer_id: raw.customer.map(Reference::into_id),
        state: ProviderState {
            status,
            current_period_start: unix(raw.current_period_start, "current_period_start")?,
            current_period_end: unix(raw.current_period_end, "current_period_end")?,
            cancel_at_period_end: raw.cancel_at_period_end,
        },
        context: context(&raw.metadata).ok(),
    })
}

fn invoice(object: &serde_json::Value) -> BillingResult<InvoiceSnapshot> {
    let raw: RawInvoice = decode(object)?;
    Ok(InvoiceSnapshot {
        invoice_id: raw.id,
        subscription_id: raw.subscription.map(Reference::into_id),
        payment_intent_id: raw.payment_intent.map(Reference::into_id),
        amount_paid_minor: raw.amount_paid,
        currency: raw.currency,
        billing_reason: raw.billing_reason,
    })
}
