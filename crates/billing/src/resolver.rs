//! Subscription Resolver
//!
//! Picks the one authoritative subscription for a company. The store is not
//! trusted to hold at most one active row per company; when it holds several,
//! the newest by `created_at` wins and the anomaly is returned to the caller.

use botdesk_shared::{CompanyId, Plan, Subscription, SubscriptionId, SubscriptionWithPlan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::store::QuotaStore;

/// More than one row for a company was flagged active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipleActiveSubscriptions {
    pub company_id: CompanyId,
    /// Every active row, newest first
    pub subscription_ids: Vec<SubscriptionId>,
    pub chosen: SubscriptionId,
}

/// The current subscription for a company
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSubscription {
    pub subscription: Subscription,
    /// Plan from the join; `None` if the join found no plan row
    pub plan: Option<Plan>,
    /// Set when the single-active-subscription invariant was violated
    pub anomaly: Option<MultipleActiveSubscriptions>,
}

/// Select the current subscription from a company's rows.
///
/// Inactive rows are ignored. Among active rows the latest `created_at` wins,
/// with the greater id breaking exact ties, so the result does not depend on
/// the order rows arrive in.
pub fn select_current(
    company_id: CompanyId,
    rows: Vec<SubscriptionWithPlan>,
) -> BillingResult<Option<ResolvedSubscription>> {
    if let Some(stray) = rows
        .iter()
        .find(|r| r.subscription.company_id != company_id)
    {
        return Err(BillingError::DataIntegrity(format!(
            "subscription {} belongs to company {}, requested {}",
            stray.subscription.id, stray.subscription.company_id, company_id
        )));
    }

    let mut active: Vec<SubscriptionWithPlan> =
        rows.into_iter().filter(|r| r.subscription.is_active).collect();

    // Newest first
    active.sort_by(|a, b| {
        (b.subscription.created_at, b.subscription.id)
            .cmp(&(a.subscription.created_at, a.subscription.id))
    });

    let anomaly = if active.len() > 1 {
        Some(MultipleActiveSubscriptions {
            company_id,
            subscription_ids: active.iter().map(|r| r.subscription.id).collect(),
            chosen: active[0].subscription.id,
        })
    } else {
        None
    };

    Ok(active.into_iter().next().map(|current| ResolvedSubscription {
        subscription: current.subscription,
        plan: current.plan,
        anomaly,
    }))
}

/// Resolves a company's current subscription from the store
#[derive(Clone)]
pub struct SubscriptionResolver {
    store: Arc<dyn QuotaStore>,
}

impl SubscriptionResolver {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// `Ok(None)` means the company has no active subscription, which is a
    /// normal business state rather than an error.
    pub async fn resolve(&self, company_id: CompanyId) -> BillingResult<Option<ResolvedSubscription>> {
        let rows = self.store.list_active_subscriptions(company_id).await?;
        let resolved = select_current(company_id, rows)?;

        match &resolved {
            None => {
                tracing::info!(company_id = %company_id, "No active subscription");
            }
            Some(r) => {
                if let Some(anomaly) = &r.anomaly {
                    let ids: Vec<String> =
                        anomaly.subscription_ids.iter().map(|id| id.to_string()).collect();
                    tracing::warn!(
                        company_id = %company_id,
                        active_count = anomaly.subscription_ids.len(),
                        subscription_ids = %ids.join(","),
                        chosen = %anomaly.chosen,
                        "Multiple active subscriptions; using the most recently created"
                    );
                }
                tracing::debug!(
                    company_id = %company_id,
                    subscription_id = %r.subscription.id,
                    plan_id = %r.subscription.plan_id,
                    "Resolved current subscription"
                );
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use botdesk_shared::PlanId;
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn row(company_id: CompanyId, is_active: bool, created_at: OffsetDateTime) -> SubscriptionWithPlan {
        SubscriptionWithPlan {
            subscription: Subscription {
                id: SubscriptionId::new(),
                company_id,
                plan_id: PlanId::new(),
                start_date: created_at,
                end_date: None,
                is_active,
                created_at,
            },
            plan: None,
        }
    }

    #[test]
    fn test_no_rows_is_no_subscription() {
        let resolved = select_current(CompanyId::new(), vec![]).unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn test_only_inactive_rows_is_no_subscription() {
        let company = CompanyId::new();
        let rows = vec![row(company, false, datetime!(2025-09-01 0:00 UTC))];
        assert!(select_current(company, rows).unwrap().is_none());
    }

    #[test]
    fn test_single_active_row_has_no_anomaly() {
        let company = CompanyId::new();
        let active = row(company, true, datetime!(2025-09-01 0:00 UTC));
        let expected = active.subscription.id;
        let rows = vec![row(company, false, datetime!(2025-10-01 0:00 UTC)), active];

        let resolved = select_current(company, rows).unwrap().unwrap();
        assert_eq!(resolved.subscription.id, expected);
        assert!(resolved.anomaly.is_none());
    }

    #[test]
    fn test_latest_created_at_wins() {
        let company = CompanyId::new();
        let t1 = row(company, true, datetime!(2025-09-01 0:00 UTC));
        let t2 = row(company, true, datetime!(2025-10-01 0:00 UTC));
        let (id1, id2) = (t1.subscription.id, t2.subscription.id);

        let resolved = select_current(company, vec![t1, t2]).unwrap().unwrap();
        assert_eq!(resolved.subscription.id, id2);

        let anomaly = resolved.anomaly.unwrap();
        assert_eq!(anomaly.chosen, id2);
        assert_eq!(anomaly.subscription_ids, vec![id2, id1]);
    }

    #[test]
    fn test_equal_created_at_breaks_tie_by_id() {
        let company = CompanyId::new();
        let ts = datetime!(2025-10-01 0:00 UTC);
        let a = row(company, true, ts);
        let b = row(company, true, ts);
        let expected = a.subscription.id.max(b.subscription.id);

        let forward = select_current(company, vec![a.clone(), b.clone()]).unwrap().unwrap();
        let backward = select_current(company, vec![b, a]).unwrap().unwrap();
        assert_eq!(forward.subscription.id, expected);
        assert_eq!(backward.subscription.id, expected);
    }

    #[test]
    fn test_rejects_rows_from_other_company() {
        let company = CompanyId::new();
        let rows = vec![row(CompanyId::new(), true, datetime!(2025-10-01 0:00 UTC))];
        assert!(matches!(
            select_current(company, rows),
            Err(BillingError::DataIntegrity(_))
        ));
    }
}
