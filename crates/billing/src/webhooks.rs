//! Stripe webhook handling
//!
//! Flow for one delivery:
//!
//! 1. Verify the signature and read the envelope ([`WebhookHandler::verify_event`]).
//! 2. Atomically claim the event in the ledger. Already-processed events are
//!    acknowledged without side effects; a fresh claim held elsewhere is
//!    reported as [`BillingError::EventInFlight`].
//! 3. Convert to a typed [`ProviderEvent`] and run its handler.
//! 4. Mark the event processed on success, or release the claim with the
//!    error so redelivery can retry.
//!
//! Handlers overwrite local state with whatever the provider reports; they do
//! not consult the lifecycle transition rules.

use std::sync::Arc;

use billsync_shared::{PaymentId, SubscriptionStatus, TenantId};
use time::{Duration, OffsetDateTime};

use crate::client::StripeConfig;
use crate::email::BillingEmailService;
use crate::error::{best_effort, BillingError, BillingResult, Disposition, WriteClass};
use crate::events::{
    CheckoutCompleted, EventEnvelope, InvoiceSnapshot, ProviderEvent, SubscriptionSnapshot,
};
use crate::history::{AuditEntry, SubscriptionHistory};
use crate::models::{
    format_minor, Actor, LedgerClaim, LedgerEntry, Payment, SubscriptionUpsert, TenantContact,
    TransactionKind,
};
use crate::provider::PaymentProvider;
use crate::signature::SignatureVerifier;
use crate::store::BillingStore;

/// A claim left unfinished this long can be taken over by a redelivery
pub const CLAIM_TIMEOUT: Duration = Duration::minutes(30);

/// What happened to an accepted delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Handler ran and changed local state
    Applied { kind: String },
    /// Accepted and marked processed, nothing to do
    Ignored { kind: String, reason: &'static str },
    /// Seen and processed before
    Duplicate,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    email: BillingEmailService,
    history: SubscriptionHistory,
    verifier: SignatureVerifier,
    default_plan_name: String,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        email: BillingEmailService,
        config: &StripeConfig,
        default_plan_name: impl Into<String>,
    ) -> Self {
        Self {
            history: SubscriptionHistory::new(store.clone()),
            verifier: SignatureVerifier::new(&config.webhook_secret, config.webhook_tolerance),
            store,
            provider,
            email,
            default_plan_name: default_plan_name.into(),
        }
    }

    /// Verify, dedupe and apply one delivery
    pub async fn process(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        let envelope = self.verify_event(payload, signature)?;
        self.handle_event(&envelope, payload).await
    }

    /// Check the signature header and parse the event envelope
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<EventEnvelope> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.verifier.verify(payload, signature, now)?;
        EventEnvelope::parse(payload).inspect_err(|e| {
            tracing::warn!(error = %e, "Signed webhook payload could not be parsed")
        })
    }

    /// Handle a verified event under the idempotency ledger
    pub async fn handle_event(
        &self,
        envelope: &EventEnvelope,
        raw: &[u8],
    ) -> BillingResult<WebhookOutcome> {
        let event_id = envelope.id.as_str();
        let entry = LedgerEntry {
            provider_event_id: event_id.to_string(),
            event_kind: envelope.kind.clone(),
            payload: String::from_utf8_lossy(raw).into_owned(),
        };

        match self.store.claim_event(&entry, CLAIM_TIMEOUT).await {
            Ok(LedgerClaim::Claimed) => {}
            Ok(LedgerClaim::AlreadyProcessed) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %envelope.kind,
                    "Duplicate webhook event, already processed"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            Ok(LedgerClaim::InFlight) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %envelope.kind,
                    "Webhook event is being processed by another delivery"
                );
                return Err(BillingError::EventInFlight(event_id.to_string()));
            }
            Err(e) => {
                // Handlers are safe to re-run, so a ledger outage must not block processing
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to claim webhook event in ledger, processing anyway"
                );
            }
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %envelope.kind,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(envelope).await;

        match &result {
            Ok(_) => {
                best_effort(
                    WriteClass::Secondary,
                    "webhook ledger completion",
                    self.store.mark_event_processed(event_id).await,
                )?;
            }
            Err(e) => {
                match e.disposition() {
                    Disposition::Permanent => tracing::warn!(
                        event_id = %event_id,
                        event_type = %envelope.kind,
                        error = %e,
                        "Webhook event rejected"
                    ),
                    Disposition::Transient => tracing::error!(
                        event_id = %event_id,
                        event_type = %envelope.kind,
                        error = %e,
                        "Webhook event failed, awaiting redelivery"
                    ),
                }
                best_effort(
                    WriteClass::Secondary,
                    "webhook ledger release",
                    self.store.release_event(event_id, &e.to_string()).await,
                )?;
            }
        }

        result
    }

    async fn process_event_internal(
        &self,
        envelope: &EventEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let event = ProviderEvent::try_from(envelope)?;
        let kind = event.kind().to_string();

        match event {
            ProviderEvent::CheckoutCompleted(done) => {
                self.handle_checkout_completed(&envelope.id, done).await?;
            }
            ProviderEvent::SubscriptionCreated(snapshot)
            | ProviderEvent::SubscriptionUpdated(snapshot) => {
                if !self.handle_subscription_changed(&envelope.id, snapshot).await? {
                    return Ok(ignored(kind, "no local subscription"));
                }
            }
            ProviderEvent::SubscriptionDeleted(snapshot) => {
                if !self.handle_subscription_deleted(&envelope.id, snapshot).await? {
                    return Ok(ignored(kind, "no local subscription"));
                }
            }
            ProviderEvent::PaymentSucceeded(invoice) => {
                if invoice.subscription_id.is_none() {
                    return Ok(ignored(kind, "invoice has no subscription"));
                }
                self.handle_payment_succeeded(&envelope.id, invoice).await?;
            }
            ProviderEvent::PaymentFailed(invoice) => {
                if invoice.subscription_id.is_none() {
                    return Ok(ignored(kind, "invoice has no subscription"));
                }
                self.handle_payment_failed(&envelope.id, invoice).await?;
            }
            ProviderEvent::Unhandled(kind) => {
                tracing::info!(
                    event_type = %kind,
                    event_id = %envelope.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                return Ok(ignored(kind, "unhandled event type"));
            }
        }

        Ok(WebhookOutcome::Applied { kind })
    }

    async fn handle_checkout_completed(
        &self,
        event_id: &str,
        done: CheckoutCompleted,
    ) -> BillingResult<()> {
        let ctx = done.context;
        let plan = self
            .store
            .get_plan(ctx.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", ctx.plan_id)))?;
        if self.store.get_tenant(ctx.tenant_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("tenant {}", ctx.tenant_id)));
        }

        let remote = self
            .provider
            .retrieve_subscription(&done.subscription_id)
            .await?;

        let change = self
            .store
            .upsert_subscription(&SubscriptionUpsert {
                tenant_id: ctx.tenant_id,
                plan_id: ctx.plan_id,
                provider_subscription_id: done.subscription_id.clone(),
                provider_customer_id: remote.customer_id.or(done.customer_id),
                checkout_session_id: Some(done.session_id.clone()),
                state: remote.state,
            })
            .await?;
        let sub = &change.current;

        best_effort(
            WriteClass::Secondary,
            "tenant plan label",
            self.store
                .set_tenant_plan_label(ctx.tenant_id, &plan.name)
                .await,
        )?;

        self.history
            .record(
                WriteClass::Secondary,
                AuditEntry::new(sub, TransactionKind::Create, Actor::System)
                    .statuses(change.previous, Some(sub.status))
                    .metadata(serde_json::json!({
                        "source": "webhook",
                        "event_id": event_id,
                        "checkout_session_id": done.session_id,
                    })),
            )
            .await?;

        if sub.status.is_entitled() && change.status_changed() {
            if let Some(contact) = self.owner_contact(ctx.tenant_id).await {
                if let Err(e) = self
                    .email
                    .send_subscription_activated(
                        &contact.owner_email,
                        &contact.name,
                        &plan.display_name,
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to send subscription activated email");
                }
            }
        }

        tracing::info!(
            tenant_id = %ctx.tenant_id,
            subscription_id = %done.subscription_id,
            plan = %plan.name,
            status = %sub.status,
            "Checkout completed"
        );
        Ok(())
    }

    /// `false` when there is no row to update and the event carries no context to create one
    async fn handle_subscription_changed(
        &self,
        event_id: &str,
        snapshot: SubscriptionSnapshot,
    ) -> BillingResult<bool> {
        let change = match snapshot.context {
            Some(ctx) => Some(
                self.store
                    .upsert_subscription(&SubscriptionUpsert {
                        tenant_id: ctx.tenant_id,
                        plan_id: ctx.plan_id,
                        provider_subscription_id: snapshot.subscription_id.clone(),
                        provider_customer_id: snapshot.customer_id.clone(),
                        checkout_session_id: None,
                        state: snapshot.state.clone(),
                    })
                    .await?,
            ),
            None => {
                self.store
                    .update_provider_state(&snapshot.subscription_id, &snapshot.state)
                    .await?
            }
        };

        let Some(change) = change else {
            tracing::info!(
                subscription_id = %snapshot.subscription_id,
                "Subscription event for unknown subscription without checkout context"
            );
            return Ok(false);
        };
        let sub = &change.current;

        if change.status_changed() {
            self.history
                .record(
                    WriteClass::Secondary,
                    AuditEntry::new(sub, TransactionKind::StatusChange, Actor::System)
                        .statuses(change.previous, Some(sub.status))
                        .metadata(serde_json::json!({ "source": "webhook", "event_id": event_id })),
                )
                .await?;

            if sub.status == SubscriptionStatus::PastDue {
                tracing::warn!(
                    tenant_id = %sub.tenant_id,
                    subscription_id = %snapshot.subscription_id,
                    "Subscription is past due"
                );
                self.notify_past_due(sub.tenant_id).await;
            }
        }

        tracing::info!(
            tenant_id = %sub.tenant_id,
            subscription_id = %snapshot.subscription_id,
            status = %sub.status,
            cancel_at_period_end = sub.cancel_at_period_end,
            "Subscription updated"
        );
        Ok(true)
    }

    async fn handle_subscription_deleted(
        &self,
        event_id: &str,
        snapshot: SubscriptionSnapshot,
    ) -> BillingResult<bool> {
        let Some(change) = self
            .store
            .cancel_by_handle(&snapshot.subscription_id, OffsetDateTime::now_utc())
            .await?
        else {
            tracing::info!(
                subscription_id = %snapshot.subscription_id,
                "Deleted subscription is not tracked locally"
            );
            return Ok(false);
        };
        let sub = &change.current;

        best_effort(
            WriteClass::Secondary,
            "tenant plan label",
            self.store
                .set_tenant_plan_label(sub.tenant_id, &self.default_plan_name)
                .await,
        )?;

        self.history
            .record(
                WriteClass::Secondary,
                AuditEntry::new(sub, TransactionKind::Cancel, Actor::System)
                    .statuses(change.previous, Some(SubscriptionStatus::Canceled))
                    .metadata(serde_json::json!({ "source": "webhook", "event_id": event_id })),
            )
            .await?;

        if change.status_changed() {
            if let Some(contact) = self.owner_contact(sub.tenant_id).await {
                if let Err(e) = self
                    .email
                    .send_subscription_canceled(&contact.owner_email, &contact.name)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to send subscription canceled email");
                }
            }
        }

        tracing::info!(
            tenant_id = %sub.tenant_id,
            subscription_id = %snapshot.subscription_id,
            "Subscription canceled"
        );
        Ok(true)
    }

    async fn handle_payment_succeeded(
        &self,
        event_id: &str,
        invoice: InvoiceSnapshot,
    ) -> BillingResult<()> {
        let Some(handle) = invoice.subscription_id.as_deref() else {
            return Ok(());
        };
        let sub = self
            .store
            .find_by_handle(handle)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {handle}")))?;

        let payment = Payment {
            id: PaymentId::new(),
            subscription_id: sub.id,
            tenant_id: sub.tenant_id,
            amount_minor: invoice.amount_paid_minor,
            currency: invoice.currency.clone(),
            status: "succeeded".to_string(),
            provider_payment_intent_id: invoice.payment_intent_id.clone(),
            provider_invoice_id: invoice.invoice_id.clone(),
            paid_at: OffsetDateTime::now_utc(),
        };

        if !self.store.insert_payment(&payment).await? {
            tracing::info!(
                invoice_id = %invoice.invoice_id,
                "Payment for invoice already recorded"
            );
            return Ok(());
        }

        if invoice.billing_reason.as_deref() == Some("subscription_cycle") {
            self.history
                .record(
                    WriteClass::Secondary,
                    AuditEntry::new(&sub, TransactionKind::Renew, Actor::System).metadata(
                        serde_json::json!({
                            "source": "webhook",
                            "event_id": event_id,
                            "invoice_id": invoice.invoice_id,
                        }),
                    ),
                )
                .await?;
        }

        if let Some(contact) = self.owner_contact(sub.tenant_id).await {
            let amount = format_minor(payment.amount_minor, &payment.currency);
            if let Err(e) = self
                .email
                .send_payment_receipt(&contact.owner_email, &contact.name, &amount)
                .await
            {
                tracing::warn!(error = %e, "Failed to send payment receipt email");
            }
        }

        tracing::info!(
            tenant_id = %sub.tenant_id,
            invoice_id = %invoice.invoice_id,
            amount_minor = payment.amount_minor,
            currency = %payment.currency,
            "Payment recorded"
        );
        Ok(())
    }

    async fn handle_payment_failed(
        &self,
        event_id: &str,
        invoice: InvoiceSnapshot,
    ) -> BillingResult<()> {
        let Some(handle) = invoice.subscription_id.as_deref() else {
            return Ok(());
        };
        let change = self
            .store
            .set_status_by_handle(handle, SubscriptionStatus::PastDue)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {handle}")))?;
        let sub = &change.current;

        if change.status_changed() {
            self.history
                .record(
                    WriteClass::Secondary,
                    AuditEntry::new(sub, TransactionKind::StatusChange, Actor::System)
                        .statuses(change.previous, Some(SubscriptionStatus::PastDue))
                        .metadata(serde_json::json!({
                            "source": "webhook",
                            "event_id": event_id,
                            "invoice_id": invoice.invoice_id,
                        })),
                )
                .await?;
            self.notify_past_due(sub.tenant_id).await;
        }

        tracing::warn!(
            tenant_id = %sub.tenant_id,
            subscription_id = %handle,
            invoice_id = %invoice.invoice_id,
            "Invoice payment failed, subscription past due"
        );
        Ok(())
    }

    async fn notify_past_due(&self, tenant_id: TenantId) {
        if let Some(contact) = self.owner_contact(tenant_id).await {
            if let Err(e) = self
                .email
                .send_subscription_past_due(&contact.owner_email, &contact.name)
                .await
            {
                tracing::warn!(error = %e, "Failed to send past due email");
            }
        }
    }

    async fn owner_contact(&self, tenant_id: TenantId) -> Option<TenantContact> {
        if !self.email.is_enabled() {
            return None;
        }
        match self.store.tenant_contact(tenant_id).await {
            Ok(contact) => contact,
            Err(e) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Failed to look up tenant owner"
                );
                None
            }
        }
    }
}

fn ignored(kind: String, reason: &'static str) -> WebhookOutcome {
    WebhookOutcome::Ignored { kind, reason }
}
