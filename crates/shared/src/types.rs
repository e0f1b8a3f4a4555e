//! Common types used across billsync

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }
    };
}

id_type!(
    /// Tenant (company) ID wrapper
    TenantId
);
id_type!(
    /// User ID wrapper
    UserId
);
id_type!(
    /// Plan ID wrapper
    PlanId
);
id_type!(
    /// Local subscription row ID wrapper
    SubscriptionId
);
id_type!(
    /// Payment row ID wrapper
    PaymentId
);
id_type!(
    /// Audit transaction row ID wrapper
    TransactionId
);

// =============================================================================
// Subscription Status
// =============================================================================

/// Lifecycle status of a subscription.
///
/// Forward path is `incomplete -> trialing -> active -> past_due -> canceled`,
/// with `past_due -> active` on payment recovery. `canceled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

/// Returned when a status string is not one of the known lifecycle states
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subscription status: {0}")]
pub struct UnknownStatus(pub String);

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 5] = [
        SubscriptionStatus::Incomplete,
        SubscriptionStatus::Trialing,
        SubscriptionStatus::Active,
        SubscriptionStatus::PastDue,
        SubscriptionStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a payment-provider status onto the local lifecycle.
    ///
    /// The provider knows a few states this system folds together:
    /// `unpaid` and `paused` behave like `past_due`, `incomplete_expired` is terminal.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" | "paused" => Some(SubscriptionStatus::PastDue),
            "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SubscriptionStatus::Incomplete => 0,
            SubscriptionStatus::Trialing => 1,
            SubscriptionStatus::Active => 2,
            SubscriptionStatus::PastDue => 3,
            SubscriptionStatus::Canceled => 4,
        }
    }

    /// Whether a locally initiated change from `self` to `next` is allowed.
    ///
    /// Re-asserting the current state is always allowed.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (SubscriptionStatus::Canceled, _) => false,
            (SubscriptionStatus::PastDue, SubscriptionStatus::Active) => true,
            _ => next.rank() > self.rank(),
        }
    }

    /// Statuses that count as a live, entitled subscription
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == SubscriptionStatus::Canceled
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_only_local_names() {
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert!("unpaid".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn provider_statuses_fold_into_lifecycle() {
        assert_eq!(
            SubscriptionStatus::from_provider("unpaid"),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(
            SubscriptionStatus::from_provider("incomplete_expired"),
            Some(SubscriptionStatus::Canceled)
        );
        assert_eq!(SubscriptionStatus::from_provider("mystery"), None);
    }

    #[test]
    fn canceled_is_terminal() {
        for next in SubscriptionStatus::ALL {
            let allowed = SubscriptionStatus::Canceled.can_transition_to(next);
            assert_eq!(allowed, next == SubscriptionStatus::Canceled, "{next}");
        }
    }

    #[test]
    fn payment_recovery_and_forward_moves() {
        use SubscriptionStatus::*;
        assert!(PastDue.can_transition_to(Active));
        assert!(Active.can_transition_to(PastDue));
        assert!(Incomplete.can_transition_to(Trialing));
        assert!(Trialing.can_transition_to(Canceled));
        assert!(!Active.can_transition_to(Trialing));
        assert!(!PastDue.can_transition_to(Incomplete));
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = TenantId::new();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<PlanId>().is_err());
    }
}
