//! Plan catalog (read-only)

use botdesk_shared::{Plan, PlanId};
use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::resolver::ResolvedSubscription;
use crate::store::QuotaStore;

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn QuotaStore>,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// Look up a plan by id. Deactivated plans are still returned so existing
    /// subscriptions keep their original terms.
    pub async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        self.store.get_plan(plan_id).await
    }

    /// Every plan, cheapest first
    pub async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_plans().await
    }

    /// Plans new subscriptions may reference
    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let plans = self.store.list_plans().await?;
        Ok(plans.into_iter().filter(|p| p.is_active).collect())
    }

    /// The plan a resolved subscription is billed on.
    ///
    /// Uses the joined plan when it is the referenced one, otherwise fetches it.
    /// A dangling plan reference is an integrity error, not a missing entity.
    pub async fn plan_for(&self, resolved: &ResolvedSubscription) -> BillingResult<Plan> {
        let plan_id = resolved.subscription.plan_id;
        if let Some(plan) = resolved.plan.as_ref().filter(|p| p.id == plan_id) {
            return Ok(plan.clone());
        }

        match self.store.get_plan(plan_id).await {
            Ok(plan) => Ok(plan),
            Err(BillingError::NotFound(_)) => Err(BillingError::DataIntegrity(format!(
                "subscription {} references missing plan {}",
                resolved.subscription.id, plan_id
            ))),
            Err(e) => Err(e),
        }
    }
}
