//! Common types used across Botdesk

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SharedError;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
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

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = SharedError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| SharedError::Validation(format!("invalid id '{}': {}", s, e)))
            }
        }
    };
}

id_wrapper!(
    /// Company (billed entity) ID wrapper
    CompanyId
);
id_wrapper!(
    /// Subscription ID wrapper
    SubscriptionId
);
id_wrapper!(
    /// Plan ID wrapper
    PlanId
);
id_wrapper!(
    /// Usage record ID wrapper
    UsageRecordId
);

// =============================================================================
// Billing Window
// =============================================================================

/// Half-open `[start, end)` time range used to scope usage.
///
/// A missing bound is unbounded on that side, so `BillingWindow::lifetime()`
/// covers every record a subscription ever logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawBillingWindow")]
pub struct BillingWindow {
    #[serde(with = "time::serde::rfc3339::option", default)]
    start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    end: Option<OffsetDateTime>,
}

/// Wire form of `BillingWindow`; deserialization goes through `BillingWindow::new`
#[derive(Deserialize)]
struct RawBillingWindow {
    #[serde(with = "time::serde::rfc3339::option", default)]
    start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    end: Option<OffsetDateTime>,
}

impl TryFrom<RawBillingWindow> for BillingWindow {
    type Error = SharedError;

    fn try_from(raw: RawBillingWindow) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl BillingWindow {
    /// Build a window, rejecting `start > end` when both bounds are set.
    /// `start == end` is a valid, empty window.
    pub fn new(
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Self, SharedError> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(SharedError::Validation(format!(
                    "billing window start {} is after end {}",
                    s, e
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Unbounded window (lifetime-to-date)
    pub fn lifetime() -> Self {
        Self::default()
    }

    /// The period a subscription grants quota for: `[start_date, end_date)`,
    /// capped at `now` when the subscription is open-ended.
    pub fn subscription_period(subscription: &Subscription, now: OffsetDateTime) -> Self {
        let end = subscription.end_date.unwrap_or(now);
        // A subscription whose start lies after the cap gets an empty window
        // rather than an inverted one.
        let end = end.max(subscription.start_date);
        Self {
            start: Some(subscription.start_date),
            end: Some(end),
        }
    }

    pub fn start(&self) -> Option<OffsetDateTime> {
        self.start
    }

    pub fn end(&self) -> Option<OffsetDateTime> {
        self.end
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Whether `ts` falls inside `[start, end)`
    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }
}

impl std::fmt::Display for BillingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.start, self.end) {
            (None, None) => write!(f, "[lifetime)"),
            (Some(s), None) => write!(f, "[{}, ..)", s),
            (None, Some(e)) => write!(f, "[.., {})", e),
            (Some(s), Some(e)) => write!(f, "[{}, {})", s, e),
        }
    }
}

/// Predicate shared by every usage query.
///
/// The ledger read and the server aggregate both take `&UsageFilter`, so the
/// two computations can never be handed different window bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageFilter {
    pub subscription_id: SubscriptionId,
    pub window: BillingWindow,
}

impl UsageFilter {
    pub fn new(subscription_id: SubscriptionId, window: BillingWindow) -> Self {
        Self {
            subscription_id,
            window,
        }
    }

    /// Whether a ledger row satisfies this filter
    pub fn matches(&self, record: &UsageRecord) -> bool {
        record.subscription_id == self.subscription_id && self.window.contains(record.timestamp)
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Plan (pricing tier) model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub price: Decimal,
    pub token_limit: i64,
    /// Opaque to the quota core
    #[sqlx(default)]
    pub features: serde_json::Value,
    pub is_active: bool,
}

/// Subscription model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub company_id: CompanyId,
    pub plan_id: PlanId,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub is_active: bool,
    /// Tie-break only, carries no billing meaning
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Subscription row with its plan joined in (LEFT JOIN, so the plan may be missing)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionWithPlan {
    pub subscription: Subscription,
    pub plan: Option<Plan>,
}

/// One logged consumption event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub id: UsageRecordId,
    pub subscription_id: SubscriptionId,
    /// Signed because that is what the column stores; negatives are rejected on read
    pub total_tokens: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
