//! Domain records shared by the store, the services and the HTTP layer

use std::fmt;
use std::str::FromStr;

use billsync_shared::{
    PaymentId, PlanId, SubscriptionId, SubscriptionStatus, TenantId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingError;

// =============================================================================
// Tenants
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub owner_user_id: UserId,
    pub name: String,
    /// Denormalised plan name kept for display
    pub subscription_plan: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// What outbound mail needs to know about a tenant
#[derive(Debug, Clone)]
pub struct TenantContact {
    pub tenant_id: TenantId,
    pub name: String,
    pub owner_email: String,
}

// =============================================================================
// Plans
// =============================================================================

/// Monthly quota ceilings. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_chats_per_month: Option<i32>,
    pub max_file_uploads_per_month: Option<i32>,
    pub max_file_size_mb: Option<i32>,
    pub max_forecast_refreshes_per_month: Option<i32>,
}

impl PlanLimits {
    /// Used when neither the tenant's plan nor the default plan can be read
    pub const FALLBACK: PlanLimits = PlanLimits {
        max_chats_per_month: Some(50),
        max_file_uploads_per_month: Some(5),
        max_file_size_mb: Some(5),
        max_forecast_refreshes_per_month: Some(10),
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub display_name: String,
    /// Integer minor units of `currency`
    pub price_monthly_minor: i64,
    pub price_yearly_minor: Option<i64>,
    pub currency: String,
    /// Provider price handle used for checkout
    pub provider_price_id: Option<String>,
    #[serde(flatten)]
    pub limits: PlanLimits,
    pub features: serde_json::Value,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Plan {
    /// Position of the stock tiers in admin listings; custom plans sort last
    pub fn tier_rank(&self) -> u8 {
        match self.name.as_str() {
            "free" => 0,
            "pro" => 1,
            "enterprise" => 2,
            _ => 3,
        }
    }
}

/// Input for creating a catalogue entry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub display_name: String,
    pub price_monthly_minor: i64,
    pub price_yearly_minor: Option<i64>,
    pub currency: Option<String>,
    pub provider_price_id: Option<String>,
    #[serde(flatten)]
    pub limits: PlanLimits,
    pub features: Option<serde_json::Value>,
}

/// Partial update of a catalogue entry; `None` leaves the field alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanUpdate {
    pub display_name: Option<String>,
    pub price_monthly_minor: Option<i64>,
    pub price_yearly_minor: Option<i64>,
    pub currency: Option<String>,
    pub provider_price_id: Option<String>,
    pub max_chats_per_month: Option<i32>,
    pub max_file_uploads_per_month: Option<i32>,
    pub max_file_size_mb: Option<i32>,
    pub max_forecast_refreshes_per_month: Option<i32>,
    pub features: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

impl PlanUpdate {
    pub fn apply(&self, plan: &mut Plan) {
        if let Some(v) = &self.display_name {
            plan.display_name = v.clone();
        }
        if let Some(v) = self.price_monthly_minor {
            plan.price_monthly_minor = v;
        }
        if let Some(v) = self.price_yearly_minor {
            plan.price_yearly_minor = Some(v);
        }
        if let Some(v) = &self.currency {
            plan.currency = v.clone();
        }
        if let Some(v) = &self.provider_price_id {
            plan.provider_price_id = Some(v.clone());
        }
        if let Some(v) = self.max_chats_per_month {
            plan.limits.max_chats_per_month = Some(v);
        }
        if let Some(v) = self.max_file_uploads_per_month {
            plan.limits.max_file_uploads_per_month = Some(v);
        }
        if let Some(v) = self.max_file_size_mb {
            plan.limits.max_file_size_mb = Some(v);
        }
        if let Some(v) = self.max_forecast_refreshes_per_month {
            plan.limits.max_forecast_refreshes_per_month = Some(v);
        }
        if let Some(v) = &self.features {
            plan.features = v.clone();
        }
        if let Some(v) = self.is_active {
            plan.is_active = v;
        }
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub checkout_session_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Subscription joined with the names admins want to see next to it
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDetail {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub tenant_name: String,
    pub plan_name: String,
}

/// Provider-side state carried by subscription events and retrievals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderState {
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
}

/// Insert-or-overwrite of a subscription keyed by its provider handle
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub provider_subscription_id: String,
    pub provider_customer_id: Option<String>,
    /// Pending checkout row to adopt, when the event names one
    pub checkout_session_id: Option<String>,
    pub state: ProviderState,
}

/// A subscription write together with the status it replaced
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: Option<SubscriptionStatus>,
    pub current: Subscription,
}

impl StateChange {
    pub fn status_changed(&self) -> bool {
        self.previous != Some(self.current.status)
    }
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub subscription_id: SubscriptionId,
    pub tenant_id: TenantId,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub provider_payment_intent_id: Option<String>,
    pub provider_invoice_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_at: OffsetDateTime,
}

/// Render integer minor units for display, e.g. `IDR 150000.00`
pub fn format_minor(amount_minor: i64, currency: &str) -> String {
    const ZERO_DECIMAL: &[&str] = &["JPY", "KRW", "VND", "CLP", "PYG", "UGX", "XAF", "XOF"];
    let code = currency.to_ascii_uppercase();
    if ZERO_DECIMAL.contains(&code.as_str()) {
        return format!("{code} {amount_minor}");
    }
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{code} {sign}{}.{:02}", abs / 100, abs % 100)
}

// =============================================================================
// Audit log
// =============================================================================

/// Who caused a recorded change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    System,
    User(UserId),
}

impl Actor {
    pub fn as_db_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::User(id) => id.fmt(f),
        }
    }
}

impl FromStr for Actor {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "system" {
            return Ok(Actor::System);
        }
        s.parse::<UserId>()
            .map(Actor::User)
            .map_err(|_| BillingError::Storage(format!("unrecognised actor '{s}'")))
    }
}

impl Serialize for Actor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Create,
    Upgrade,
    Downgrade,
    Cancel,
    Renew,
    StatusChange,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Create => "create",
            TransactionKind::Upgrade => "upgrade",
            TransactionKind::Downgrade => "downgrade",
            TransactionKind::Cancel => "cancel",
            TransactionKind::Renew => "renew",
            TransactionKind::StatusChange => "status_change",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(TransactionKind::Create),
            "upgrade" => Ok(TransactionKind::Upgrade),
            "downgrade" => Ok(TransactionKind::Downgrade),
            "cancel" => Ok(TransactionKind::Cancel),
            "renew" => Ok(TransactionKind::Renew),
            "status_change" => Ok(TransactionKind::StatusChange),
            other => Err(BillingError::Storage(format!(
                "unrecognised transaction kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionTransaction {
    pub id: TransactionId,
    pub subscription_id: SubscriptionId,
    pub tenant_id: TenantId,
    pub kind: TransactionKind,
    pub old_plan_id: Option<PlanId>,
    pub new_plan_id: Option<PlanId>,
    pub old_status: Option<SubscriptionStatus>,
    pub new_status: Option<SubscriptionStatus>,
    pub actor: Actor,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Webhook ledger
// =============================================================================

/// What gets written when an event is first seen
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub provider_event_id: String,
    pub event_kind: String,
    pub payload: String,
}

/// Result of trying to take processing rights for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerClaim {
    /// This caller owns processing
    Claimed,
    /// A previous delivery already succeeded
    AlreadyProcessed,
    /// Another delivery holds a fresh claim
    InFlight,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedEventRecord {
    pub provider_event_id: String,
    pub event_kind: String,
    pub payload: String,
    pub processed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Usage
// =============================================================================

/// Activity kinds usage is counted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    /// Messages authored by a user, not the assistant
    UserMessage,
    FileUpload,
    Forecast,
}

// =============================================================================
// Pagination
// =============================================================================

/// Normalised page request: `page >= 1`, `1 <= limit <= 100`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    pub page: i64,
    pub limit: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        let page = page.filter(|p| *p >= 1).unwrap_or(1);
        let limit = limit
            .filter(|l| (1..=Self::MAX_LIMIT).contains(l))
            .unwrap_or(Self::DEFAULT_LIMIT);
        Self { page, limit }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, page: Page, total: i64) -> Self {
        Self {
            items,
            page: page.page,
            limit: page.limit,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_clamps_out_of_range_input() {
        assert_eq!(Page::new(Some(0), Some(500)), Page { page: 1, limit: 20 });
        assert_eq!(Page::new(Some(3), Some(100)).offset(), 200);
        assert_eq!(Page::new(None, Some(0)).limit, 20);
    }

    #[test]
    fn actor_round_trips_through_text() {
        assert_eq!("system".parse::<Actor>().unwrap(), Actor::System);
        let user = UserId::new();
        assert_eq!(
            Actor::User(user).as_db_string().parse::<Actor>().unwrap(),
            Actor::User(user)
        );
        assert!("someone".parse::<Actor>().is_err());
    }

    #[test]
    fn minor_units_render_only_at_the_edge() {
        assert_eq!(format_minor(15_000_000, "idr"), "IDR 150000.00");
        assert_eq!(format_minor(1999, "usd"), "USD 19.99");
        assert_eq!(format_minor(500, "JPY"), "JPY 500");
    }
}
