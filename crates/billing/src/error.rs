//! Billing error taxonomy
//!
//! Every failure is classified along two axes:
//!
//! - [`Disposition`]: whether retrying the same input can succeed. Webhook
//!   callers use it to pick between a 4xx (redelivery is pointless) and a 5xx.
//! - [`WriteClass`]: whether a write is load-bearing. Primary writes abort the
//!   operation; secondary writes are logged and swallowed through
//!   [`best_effort`].

use thiserror::Error;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("event is missing required context: {0}")]
    MissingContext(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("webhook event {0} is already being processed")]
    EventInFlight(String),

    #[error("payment provider error: {0}")]
    ExternalProvider(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("email delivery failed: {0}")]
    Email(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Whether an error is worth retrying with the same input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The same input will fail the same way
    Permanent,
    /// A later attempt may succeed
    Transient,
}

impl BillingError {
    pub fn disposition(&self) -> Disposition {
        match self {
            BillingError::InvalidSignature
            | BillingError::InvalidPayload(_)
            | BillingError::MissingContext(_)
            | BillingError::NotFound(_)
            | BillingError::InvalidTransition { .. }
            | BillingError::Validation(_)
            | BillingError::Conflict(_)
            | BillingError::Config(_) => Disposition::Permanent,
            BillingError::EventInFlight(_)
            | BillingError::ExternalProvider(_)
            | BillingError::Storage(_)
            | BillingError::Email(_) => Disposition::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == Disposition::Transient
    }

    /// Map a unique-violation into `Conflict`, everything else into `Storage`
    pub(crate) fn from_write(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return BillingError::Conflict(format!("{what} already exists"));
            }
        }
        BillingError::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidPayload(err.to_string())
    }
}

/// How much a write matters to the operation performing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteClass {
    /// Failure aborts the operation and is returned to the caller
    Primary,
    /// Failure is logged and the operation carries on
    Secondary,
}

/// Apply a write's classification to its result.
///
/// Primary results pass through untouched. Secondary failures are logged with
/// `label` and turned into `Ok(None)` so callers can keep going.
pub fn best_effort<T>(
    class: WriteClass,
    label: &str,
    result: BillingResult<T>,
) -> BillingResult<Option<T>> {
    match (class, result) {
        (_, Ok(value)) => Ok(Some(value)),
        (WriteClass::Primary, Err(e)) => Err(e),
        (WriteClass::Secondary, Err(e)) => {
            tracing::warn!(write = %label, error = %e, "Secondary write failed, continuing");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_input_errors_are_permanent() {
        assert_eq!(
            BillingError::InvalidSignature.disposition(),
            Disposition::Permanent
        );
        assert_eq!(
            BillingError::MissingContext("plan_id".into()).disposition(),
            Disposition::Permanent
        );
        assert!(BillingError::Storage("down".into()).is_transient());
        assert!(BillingError::EventInFlight("evt_1".into()).is_transient());
    }

    #[test]
    fn secondary_failures_are_swallowed() {
        let swallowed: BillingResult<Option<()>> = best_effort(
            WriteClass::Secondary,
            "tenant label",
            Err(BillingError::Storage("boom".into())),
        );
        assert!(matches!(swallowed, Ok(None)));

        let surfaced: BillingResult<Option<()>> = best_effort(
            WriteClass::Primary,
            "subscription",
            Err(BillingError::Storage("boom".into())),
        );
        assert!(matches!(surfaced, Err(BillingError::Storage(_))));

        assert!(matches!(
            best_effort(WriteClass::Secondary, "ok", Ok(7)),
            Ok(Some(7))
        ));
    }
}
