//! In-memory `QuotaStore` for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use botdesk_billing::{BillingError, BillingResult, QuotaStore};
use botdesk_shared::{
    CompanyId, Plan, PlanId, Subscription, SubscriptionId, SubscriptionWithPlan, UsageFilter,
    UsageRecord, UsageRecordId,
};
use rust_decimal::Decimal;
use std::time::Duration;
use time::OffsetDateTime;

/// Store backed by plain vectors, with knobs to reproduce backend faults
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    pub plans: Vec<Plan>,
    pub subscriptions: Vec<Subscription>,
    pub usage: Vec<UsageRecord>,
    /// Force the server aggregate to this value
    pub aggregate_override: Option<i64>,
    /// Reproduce a server aggregate that drops the window predicate
    pub aggregate_ignores_window: bool,
    /// Fail every call with `Unavailable`
    pub unavailable: bool,
    /// Sleep before answering usage queries
    pub usage_delay: Option<Duration>,
    /// Hand back rows without applying the window
    pub ledger_ignores_window: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plan(&mut self, name: &str, token_limit: i64) -> PlanId {
        let plan = Plan {
            id: PlanId::new(),
            name: name.to_string(),
            price: Decimal::new(2999, 2),
            token_limit,
            features: serde_json::json!({ "bots": 3 }),
            is_active: true,
        };
        let id = plan.id;
        self.plans.push(plan);
        id
    }

    pub fn add_subscription(
        &mut self,
        company_id: CompanyId,
        plan_id: PlanId,
        created_at: OffsetDateTime,
        end_date: Option<OffsetDateTime>,
    ) -> SubscriptionId {
        let sub = Subscription {
            id: SubscriptionId::new(),
            company_id,
            plan_id,
            start_date: created_at,
            end_date,
            is_active: true,
            created_at,
        };
        let id = sub.id;
        self.subscriptions.push(sub);
        id
    }

    pub fn add_usage(&mut self, subscription_id: SubscriptionId, tokens: i64, at: OffsetDateTime) {
        self.usage.push(UsageRecord {
            id: UsageRecordId::new(),
            subscription_id,
            total_tokens: tokens,
            timestamp: at,
        });
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable {
            Err(BillingError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn ensure_subscription(&self, id: SubscriptionId) -> BillingResult<()> {
        if self.subscriptions.iter().any(|s| s.id == id) {
            Ok(())
        } else {
            Err(BillingError::NotFound(format!("Subscription {} not found", id)))
        }
    }

    async fn maybe_delay(&self) {
        if let Some(delay) = self.usage_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl QuotaStore for InMemoryStore {
    async fn list_active_subscriptions(
        &self,
        company_id: CompanyId,
    ) -> BillingResult<Vec<SubscriptionWithPlan>> {
        self.check_available()?;
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.company_id == company_id && s.is_active)
            .map(|s| SubscriptionWithPlan {
                subscription: s.clone(),
                plan: self.plans.iter().find(|p| p.id == s.plan_id).cloned(),
            })
            .collect())
    }

    async fn list_usage_records(&self, filter: &UsageFilter) -> BillingResult<Vec<UsageRecord>> {
        self.check_available()?;
        self.maybe_delay().await;
        self.ensure_subscription(filter.subscription_id)?;
        Ok(self
            .usage
            .iter()
            .filter(|r| {
                r.subscription_id == filter.subscription_id
                    && (self.ledger_ignores_window || filter.window.contains(r.timestamp))
            })
            .cloned()
            .collect())
    }

    async fn compute_usage_aggregate(&self, filter: &UsageFilter) -> BillingResult<i64> {
        self.check_available()?;
        self.maybe_delay().await;
        self.ensure_subscription(filter.subscription_id)?;
        if let Some(value) = self.aggregate_override {
            return Ok(value);
        }
        Ok(self
            .usage
            .iter()
            .filter(|r| {
                r.subscription_id == filter.subscription_id
                    && (self.aggregate_ignores_window || filter.window.contains(r.timestamp))
            })
            .map(|r| r.total_tokens)
            .sum())
    }

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        self.check_available()?;
        self.plans
            .iter()
            .find(|p| p.id == plan_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        self.check_available()?;
        let mut plans = self.plans.clone();
        plans.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.name.cmp(&b.name)));
        Ok(plans)
    }
}
