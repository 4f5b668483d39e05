//! Quota Evaluator
//!
//! Turns a resolved subscription, its plan and a consumed-token figure into the
//! quota snapshot the dashboard shows.
//!
//! ## Design Principles
//!
//! 1. **Pure**: no I/O, no clock reads; `now` is an argument
//! 2. **Total**: terminates for every input, fails only on malformed plan data
//! 3. **Honest lifecycle**: an active row past its end date is `Expired`, never `Active`

use botdesk_shared::{Plan, Subscription};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Lifecycle of the subscription backing a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    /// Company has no active subscription row
    NoSubscription,
    /// Flagged active and not past its end date
    Active,
    /// Flag cleared by billing/cancellation
    Inactive,
    /// Still flagged active but `end_date` has passed
    Expired,
}

impl LifecycleStatus {
    /// Classify a subscription row at `now`
    pub fn of(subscription: &Subscription, now: OffsetDateTime) -> Self {
        if !subscription.is_active {
            return LifecycleStatus::Inactive;
        }
        match subscription.end_date {
            Some(end) if end <= now => LifecycleStatus::Expired,
            _ => LifecycleStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleStatus::Active)
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleStatus::NoSubscription => write!(f, "no_subscription"),
            LifecycleStatus::Active => write!(f, "active"),
            LifecycleStatus::Inactive => write!(f, "inactive"),
            LifecycleStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Derived quota snapshot; recomputed on every query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub tokens_used: u64,
    pub token_limit: u64,
    pub plan_name: String,
    pub price: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub is_active: bool,
    pub percentage_used: f64,
    pub remaining: u64,
    pub over_limit: bool,
    pub lifecycle: LifecycleStatus,
}

/// `tokens_used / token_limit * 100`, or exactly 0 for a zero limit
pub fn percentage_used(tokens_used: u64, token_limit: u64) -> f64 {
    if token_limit == 0 {
        0.0
    } else {
        (tokens_used as f64 / token_limit as f64) * 100.0
    }
}

/// `max(token_limit - tokens_used, 0)`
pub fn remaining(tokens_used: u64, token_limit: u64) -> u64 {
    token_limit.saturating_sub(tokens_used)
}

/// Compute the quota status for one subscription.
///
/// `tokens_used` has already been checked non-negative by the aggregator.
/// Fails with `DataIntegrity` on a negative limit or price, or when the plan is
/// not the one the subscription references.
pub fn evaluate(
    subscription: &Subscription,
    plan: &Plan,
    tokens_used: u64,
    now: OffsetDateTime,
) -> BillingResult<QuotaStatus> {
    if plan.id != subscription.plan_id {
        return Err(BillingError::DataIntegrity(format!(
            "subscription {} references plan {}, evaluated against plan {}",
            subscription.id, subscription.plan_id, plan.id
        )));
    }
    let token_limit = u64::try_from(plan.token_limit).map_err(|_| {
        BillingError::DataIntegrity(format!(
            "plan {} has negative token_limit {}",
            plan.id, plan.token_limit
        ))
    })?;
    if plan.price < Decimal::ZERO {
        return Err(BillingError::DataIntegrity(format!(
            "plan {} has negative price {}",
            plan.id, plan.price
        )));
    }

    Ok(QuotaStatus {
        tokens_used,
        token_limit,
        plan_name: plan.name.clone(),
        price: plan.price,
        start_date: subscription.start_date,
        end_date: subscription.end_date,
        is_active: subscription.is_active,
        percentage_used: percentage_used(tokens_used, token_limit),
        remaining: remaining(tokens_used, token_limit),
        over_limit: tokens_used > token_limit,
        lifecycle: LifecycleStatus::of(subscription, now),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use botdesk_shared::{CompanyId, PlanId, SubscriptionId};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-10-20 12:00 UTC);

    fn plan(token_limit: i64) -> Plan {
        Plan {
            id: PlanId::new(),
            name: "Business".to_string(),
            price: Decimal::new(4999, 2),
            token_limit,
            features: serde_json::json!({"bots": 5}),
            is_active: true,
        }
    }

    fn subscription(plan: &Plan, is_active: bool, end_date: Option<OffsetDateTime>) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            company_id: CompanyId::new(),
            plan_id: plan.id,
            start_date: datetime!(2025-10-03 23:08:45 UTC),
            end_date,
            is_active,
            created_at: datetime!(2025-10-03 23:08:45 UTC),
        }
    }

    #[test]
    fn test_thirty_million_plan_partial_usage() {
        let plan = plan(30_000_000);
        let sub = subscription(&plan, true, Some(datetime!(2025-11-02 23:08:45 UTC)));
        let status = evaluate(&sub, &plan, 1_234_567, NOW).unwrap();

        assert_eq!(status.tokens_used, 1_234_567);
        assert_eq!(status.token_limit, 30_000_000);
        assert_eq!(status.remaining, 28_765_433);
        assert!((status.percentage_used - 4.1152).abs() < 0.0001);
        assert!(!status.over_limit);
        assert_eq!(status.lifecycle, LifecycleStatus::Active);
        assert_eq!(status.plan_name, "Business");
        assert_eq!(status.price, Decimal::new(4999, 2));
    }

    #[test]
    fn test_over_limit_never_negative_remaining() {
        let plan = plan(1_000);
        let sub = subscription(&plan, true, None);
        let status = evaluate(&sub, &plan, 1_500, NOW).unwrap();
        assert_eq!(status.remaining, 0);
        assert!(status.over_limit);
        assert!((status.percentage_used - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exactly_at_limit_is_not_over() {
        let plan = plan(1_000);
        let sub = subscription(&plan, true, None);
        let status = evaluate(&sub, &plan, 1_000, NOW).unwrap();
        assert_eq!(status.remaining, 0);
        assert!(!status.over_limit);
    }

    #[test]
    fn test_zero_limit_percentage_is_zero() {
        let plan = plan(0);
        let sub = subscription(&plan, true, None);
        let status = evaluate(&sub, &plan, 500, NOW).unwrap();
        assert_eq!(status.percentage_used, 0.0);
        assert!(!status.percentage_used.is_nan());
        assert!(status.over_limit);
    }

    #[test]
    fn test_past_end_date_is_expired() {
        let plan = plan(1_000);
        let sub = subscription(&plan, true, Some(datetime!(2025-10-01 0:00 UTC)));
        let status = evaluate(&sub, &plan, 0, NOW).unwrap();
        assert_eq!(status.lifecycle, LifecycleStatus::Expired);
        assert!(status.is_active);
    }

    #[test]
    fn test_end_date_equal_to_now_is_expired() {
        let plan = plan(1_000);
        let sub = subscription(&plan, true, Some(NOW));
        assert_eq!(LifecycleStatus::of(&sub, NOW), LifecycleStatus::Expired);
    }

    #[test]
    fn test_inactive_flag_wins_over_dates() {
        let plan = plan(1_000);
        let sub = subscription(&plan, false, None);
        assert_eq!(LifecycleStatus::of(&sub, NOW), LifecycleStatus::Inactive);
    }

    #[test]
    fn test_negative_limit_is_integrity_error() {
        let plan = plan(-1);
        let sub = subscription(&plan, true, None);
        assert!(matches!(
            evaluate(&sub, &plan, 0, NOW),
            Err(BillingError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_usage_beyond_i64_range_still_evaluates() {
        let plan = plan(i64::MAX);
        let sub = subscription(&plan, true, None);
        let status = evaluate(&sub, &plan, u64::MAX, NOW).unwrap();
        assert_eq!(status.tokens_used, u64::MAX);
        assert_eq!(status.remaining, 0);
        assert!(status.over_limit);
        assert!(status.percentage_used.is_finite());
    }

    #[test]
    fn test_negative_price_is_integrity_error() {
        let mut plan = plan(1_000);
        plan.price = Decimal::new(-100, 2);
        let sub = subscription(&plan, true, None);
        assert!(matches!(
            evaluate(&sub, &plan, 0, NOW),
            Err(BillingError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_mismatched_plan_is_integrity_error() {
        let plan_a = plan(1_000);
        let plan_b = plan(2_000);
        let sub = subscription(&plan_a, true, None);
        assert!(matches!(
            evaluate(&sub, &plan_b, 0, NOW),
            Err(BillingError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(LifecycleStatus::Active.to_string(), "active");
        assert_eq!(LifecycleStatus::Expired.to_string(), "expired");
        assert_eq!(LifecycleStatus::NoSubscription.to_string(), "no_subscription");
    }
}
