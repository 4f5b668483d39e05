//! Quota resolution service
//!
//! company → current subscription → (plan ∥ usage) → quota status.
//!
//! The resolver runs first because everything downstream is keyed by the
//! subscription it picks. The plan lookup and the usage aggregation are
//! independent reads and run concurrently. The whole pipeline races the
//! caller's cancellation token; a cancelled resolution returns
//! `BillingError::Cancelled` and never a partial status.

use botdesk_shared::{BillingWindow, CompanyId, SubscriptionId, UsageFilter};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::catalog::PlanCatalog;
use crate::config::QuotaConfig;
use crate::error::{BillingError, BillingResult};
use crate::quota::{self, LifecycleStatus, QuotaStatus};
use crate::resolver::{MultipleActiveSubscriptions, SubscriptionResolver};
use crate::store::QuotaStore;
use crate::usage::{ConsistencyMismatch, UsageAggregator, UsageReconciliation};

/// Which window usage is aggregated over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaWindow {
    /// Caller-supplied window (`BillingWindow::lifetime()` for lifetime-to-date)
    Explicit(BillingWindow),
    /// The resolved subscription's own `[start_date, end_date or now)`
    CurrentPeriod,
}

/// An invariant divergence observed while resolving
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaDiagnostic {
    MultipleActiveSubscriptions(MultipleActiveSubscriptions),
    ConsistencyMismatch(ConsistencyMismatch),
}

/// Quota status plus everything needed to audit how it was computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaReport {
    pub company_id: CompanyId,
    pub subscription_id: SubscriptionId,
    pub status: QuotaStatus,
    pub usage: UsageReconciliation,
    pub diagnostics: Vec<QuotaDiagnostic>,
}

impl QuotaReport {
    pub fn mismatch(&self) -> Option<&ConsistencyMismatch> {
        self.diagnostics.iter().find_map(|d| match d {
            QuotaDiagnostic::ConsistencyMismatch(m) => Some(m),
            _ => None,
        })
    }

    pub fn multiple_active(&self) -> Option<&MultipleActiveSubscriptions> {
        self.diagnostics.iter().find_map(|d| match d {
            QuotaDiagnostic::MultipleActiveSubscriptions(m) => Some(m),
            _ => None,
        })
    }

    /// No invariant divergence was observed
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Result of `resolve_quota_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QuotaResolution {
    NoSubscription { company_id: CompanyId },
    Resolved(QuotaReport),
}

impl QuotaResolution {
    pub fn lifecycle(&self) -> LifecycleStatus {
        match self {
            QuotaResolution::NoSubscription { .. } => LifecycleStatus::NoSubscription,
            QuotaResolution::Resolved(report) => report.status.lifecycle,
        }
    }

    pub fn report(&self) -> Option<&QuotaReport> {
        match self {
            QuotaResolution::NoSubscription { .. } => None,
            QuotaResolution::Resolved(report) => Some(report),
        }
    }

    pub fn status(&self) -> Option<&QuotaStatus> {
        self.report().map(|r| &r.status)
    }
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BillingError::Cancelled),
        result = fut => result,
    }
}

/// Quota resolution service
#[derive(Clone)]
pub struct QuotaService {
    resolver: SubscriptionResolver,
    catalog: PlanCatalog,
    aggregator: UsageAggregator,
    config: QuotaConfig,
}

impl QuotaService {
    pub fn new(store: Arc<dyn QuotaStore>, config: QuotaConfig) -> Self {
        Self {
            resolver: SubscriptionResolver::new(store.clone()),
            catalog: PlanCatalog::new(store.clone()),
            aggregator: UsageAggregator::new(store),
            config,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Resolve a company's quota over `window` (lifetime-to-date when `None`)
    pub async fn resolve_quota_status(
        &self,
        company_id: CompanyId,
        window: Option<BillingWindow>,
        cancel: &CancellationToken,
    ) -> BillingResult<QuotaResolution> {
        let window = QuotaWindow::Explicit(window.unwrap_or_else(BillingWindow::lifetime));
        self.resolve_at(company_id, window, OffsetDateTime::now_utc(), cancel)
            .await
    }

    /// Resolve a company's quota over its subscription's own period
    pub async fn resolve_current_period(
        &self,
        company_id: CompanyId,
        cancel: &CancellationToken,
    ) -> BillingResult<QuotaResolution> {
        self.resolve_at(
            company_id,
            QuotaWindow::CurrentPeriod,
            OffsetDateTime::now_utc(),
            cancel,
        )
        .await
    }

    /// Resolve with an explicit evaluation time
    pub async fn resolve_at(
        &self,
        company_id: CompanyId,
        window: QuotaWindow,
        now: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> BillingResult<QuotaResolution> {
        let result = cancellable(cancel, self.run(company_id, window, now)).await;

        if matches!(result, Err(BillingError::Cancelled)) {
            tracing::info!(company_id = %company_id, "Quota resolution cancelled");
        }
        result
    }

    async fn run(
        &self,
        company_id: CompanyId,
        window: QuotaWindow,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaResolution> {
        let Some(resolved) = self.resolver.resolve(company_id).await? else {
            return Ok(QuotaResolution::NoSubscription { company_id });
        };

        let window = match window {
            QuotaWindow::Explicit(w) => w,
            QuotaWindow::CurrentPeriod => {
                BillingWindow::subscription_period(&resolved.subscription, now)
            }
        };
        let filter = UsageFilter::new(resolved.subscription.id, window);

        let (plan, usage) = tokio::try_join!(
            self.catalog.plan_for(&resolved),
            self.aggregator.aggregate(&filter, self.config.reconcile_mode),
        )?;

        let status = quota::evaluate(&resolved.subscription, &plan, usage.tokens_used(), now)?;

        let mut diagnostics = Vec::new();
        if let Some(anomaly) = resolved.anomaly {
            diagnostics.push(QuotaDiagnostic::MultipleActiveSubscriptions(anomaly));
        }
        if let Some(mismatch) = usage.mismatch() {
            diagnostics.push(QuotaDiagnostic::ConsistencyMismatch(mismatch));
        }

        tracing::info!(
            company_id = %company_id,
            subscription_id = %resolved.subscription.id,
            plan = %status.plan_name,
            window = %window,
            tokens_used = status.tokens_used,
            token_limit = status.token_limit,
            lifecycle = %status.lifecycle,
            diagnostics = diagnostics.len(),
            "Resolved quota status"
        );

        Ok(QuotaResolution::Resolved(QuotaReport {
            company_id,
            subscription_id: resolved.subscription.id,
            status,
            usage,
            diagnostics,
        }))
    }
}
