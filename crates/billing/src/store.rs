//! Data-access boundary for quota resolution
//!
//! The core only reads. `QuotaStore` is the narrow query interface it needs;
//! `PgQuotaStore` implements it against the schema in `migrations/`.

use async_trait::async_trait;
use botdesk_shared::{
    CompanyId, Plan, PlanId, Subscription, SubscriptionId, SubscriptionWithPlan, UsageFilter,
    UsageRecord,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Read-only query interface over plans, subscriptions and the usage ledger.
///
/// Implementations report a missing entity as `BillingError::NotFound` and a
/// transport/backend failure as `BillingError::Unavailable`.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Subscriptions for a company flagged active, each joined to its plan
    async fn list_active_subscriptions(
        &self,
        company_id: CompanyId,
    ) -> BillingResult<Vec<SubscriptionWithPlan>>;

    /// Ledger rows matching the filter, ordered by (timestamp, id).
    /// Empty for an existing subscription with no usage; `NotFound` if the
    /// subscription does not exist.
    async fn list_usage_records(&self, filter: &UsageFilter) -> BillingResult<Vec<UsageRecord>>;

    /// Server-side equivalent of summing `list_usage_records` for the same filter
    async fn compute_usage_aggregate(&self, filter: &UsageFilter) -> BillingResult<i64>;

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Plan>;

    /// Every plan, active or not, cheapest first
    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

/// Flat row for the subscriptions ⟕ plans join
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionPlanRow {
    id: SubscriptionId,
    company_id: CompanyId,
    plan_id: PlanId,
    start_date: OffsetDateTime,
    end_date: Option<OffsetDateTime>,
    is_active: bool,
    created_at: OffsetDateTime,
    joined_plan_id: Option<PlanId>,
    plan_name: Option<String>,
    plan_price: Option<Decimal>,
    plan_token_limit: Option<i64>,
    plan_features: Option<serde_json::Value>,
    plan_is_active: Option<bool>,
}

impl From<SubscriptionPlanRow> for SubscriptionWithPlan {
    fn from(row: SubscriptionPlanRow) -> Self {
        let plan = match (
            row.joined_plan_id,
            row.plan_name,
            row.plan_price,
            row.plan_token_limit,
            row.plan_is_active,
        ) {
            (Some(id), Some(name), Some(price), Some(token_limit), Some(is_active)) => Some(Plan {
                id,
                name,
                price,
                token_limit,
                features: row.plan_features.unwrap_or_default(),
                is_active,
            }),
            _ => None,
        };

        SubscriptionWithPlan {
            subscription: Subscription {
                id: row.id,
                company_id: row.company_id,
                plan_id: row.plan_id,
                start_date: row.start_date,
                end_date: row.end_date,
                is_active: row.is_active,
                created_at: row.created_at,
            },
            plan,
        }
    }
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn subscription_exists(&self, subscription_id: SubscriptionId) -> BillingResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM subscriptions WHERE id = $1)")
                .bind(subscription_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn ensure_subscription(&self, subscription_id: SubscriptionId) -> BillingResult<()> {
        if self.subscription_exists(subscription_id).await? {
            Ok(())
        } else {
            Err(BillingError::NotFound(format!(
                "Subscription {} not found",
                subscription_id
            )))
        }
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn list_active_subscriptions(
        &self,
        company_id: CompanyId,
    ) -> BillingResult<Vec<SubscriptionWithPlan>> {
        let rows: Vec<SubscriptionPlanRow> = sqlx::query_as(
            r#"
            SELECT
                s.id, s.company_id, s.plan_id, s.start_date, s.end_date,
                s.is_active, s.created_at,
                p.id as joined_plan_id,
                p.name as plan_name,
                p.price as plan_price,
                p.token_limit as plan_token_limit,
                p.features as plan_features,
                p.is_active as plan_is_active
            FROM subscriptions s
            LEFT JOIN plans p ON p.id = s.plan_id
            WHERE s.company_id = $1
              AND s.is_active = true
            ORDER BY s.created_at DESC
            "#,
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(
            company_id = %company_id,
            rows = rows.len(),
            "PgQuotaStore::list_active_subscriptions: query returned"
        );

        Ok(rows.into_iter().map(SubscriptionWithPlan::from).collect())
    }

    async fn list_usage_records(&self, filter: &UsageFilter) -> BillingResult<Vec<UsageRecord>> {
        // Keep this predicate in lockstep with get_total_usage() in the migration
        let records: Vec<UsageRecord> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, total_tokens, timestamp
            FROM usage_logs
            WHERE subscription_id = $1
              AND ($2::TIMESTAMPTZ IS NULL OR timestamp >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR timestamp < $3)
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(filter.subscription_id)
        .bind(filter.window.start())
        .bind(filter.window.end())
        .fetch_all(&self.pool)
        .await?;

        if records.is_empty() {
            self.ensure_subscription(filter.subscription_id).await?;
        }

        Ok(records)
    }

    async fn compute_usage_aggregate(&self, filter: &UsageFilter) -> BillingResult<i64> {
        let (total,): (Option<i64>,) = sqlx::query_as("SELECT get_total_usage($1, $2, $3)")
            .bind(filter.subscription_id)
            .bind(filter.window.start())
            .bind(filter.window.end())
            .fetch_one(&self.pool)
            .await?;

        let total = total.unwrap_or(0);
        if total == 0 {
            self.ensure_subscription(filter.subscription_id).await?;
        }

        Ok(total)
    }

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            "SELECT id, name, price, token_limit, features, is_active FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let plans: Vec<Plan> = sqlx::query_as(
            r#"
            SELECT id, name, price, token_limit, features, is_active
            FROM plans
            ORDER BY price ASC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }
}
