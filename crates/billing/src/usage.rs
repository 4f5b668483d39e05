//! Usage aggregation
//!
//! Consumed tokens are computed two ways: a local reduction over the ledger and
//! the server-side `get_total_usage` aggregate. Both receive the same
//! `&UsageFilter`, and the reconciliation compares them exactly.

use botdesk_shared::{BillingWindow, SubscriptionId, UsageFilter, UsageRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ReconcileMode;
use crate::error::{BillingError, BillingResult};
use crate::ledger::UsageLedger;
use crate::store::QuotaStore;

/// Sum `total_tokens` with a 64-bit unsigned accumulator.
///
/// Negative rows and overflow are integrity errors, never wrapped or clamped.
pub fn sum_tokens<'a, I>(records: I) -> BillingResult<u64>
where
    I: IntoIterator<Item = &'a UsageRecord>,
{
    records.into_iter().try_fold(0u64, |acc, record| {
        let tokens = u64::try_from(record.total_tokens).map_err(|_| {
            BillingError::DataIntegrity(format!(
                "usage record {} has negative total_tokens {}",
                record.id, record.total_tokens
            ))
        })?;
        acc.checked_add(tokens).ok_or_else(|| {
            BillingError::DataIntegrity(format!(
                "token total overflowed u64 at usage record {}",
                record.id
            ))
        })
    })
}

/// Two aggregates that disagreed for identical inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyMismatch {
    pub subscription_id: SubscriptionId,
    pub window: BillingWindow,
    /// Sum over ledger rows
    pub local: u64,
    /// `get_total_usage` result
    pub server: u64,
}

impl ConsistencyMismatch {
    /// `local - server`, signed
    pub fn difference(&self) -> i128 {
        i128::from(self.local) - i128::from(self.server)
    }
}

impl From<&ConsistencyMismatch> for BillingError {
    fn from(m: &ConsistencyMismatch) -> Self {
        BillingError::ConsistencyMismatch {
            local: m.local,
            server: m.server,
        }
    }
}

/// Outcome of aggregating one filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReconciliation {
    pub filter: UsageFilter,
    pub mode: ReconcileMode,
    /// Local ledger sum; absent in `server` mode
    pub local: Option<u64>,
    /// Number of ledger rows the local sum covered
    pub record_count: Option<usize>,
    pub server: u64,
}

impl UsageReconciliation {
    /// The figure quota enforcement uses. The server aggregate is the one
    /// billing enforcement runs on, so it wins; a disagreement is still
    /// reported through `mismatch()`.
    pub fn tokens_used(&self) -> u64 {
        self.server
    }

    /// Whether both paths ran and agreed. `None` when only the server path ran.
    pub fn is_consistent(&self) -> Option<bool> {
        self.local.map(|local| local == self.server)
    }

    pub fn mismatch(&self) -> Option<ConsistencyMismatch> {
        match self.local {
            Some(local) if local != self.server => Some(ConsistencyMismatch {
                subscription_id: self.filter.subscription_id,
                window: self.filter.window,
                local,
                server: self.server,
            }),
            _ => None,
        }
    }
}

/// Computes and reconciles consumed tokens for a subscription
#[derive(Clone)]
pub struct UsageAggregator {
    ledger: UsageLedger,
    store: Arc<dyn QuotaStore>,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            ledger: UsageLedger::new(store.clone()),
            store,
        }
    }

    /// Path (a): reduce the fetched ledger locally. Returns (tokens, row count).
    pub async fn local_total(&self, filter: &UsageFilter) -> BillingResult<(u64, usize)> {
        let records = self.ledger.read(filter).await?;
        let total = sum_tokens(&records)?;
        Ok((total, records.len()))
    }

    /// Path (b): the server-computed aggregate
    pub async fn server_total(&self, filter: &UsageFilter) -> BillingResult<u64> {
        let raw = self.store.compute_usage_aggregate(filter).await?;
        u64::try_from(raw).map_err(|_| {
            BillingError::DataIntegrity(format!(
                "server aggregate for subscription {} is negative: {}",
                filter.subscription_id, raw
            ))
        })
    }

    /// Compute both paths for the same filter and report whether they agree
    pub async fn reconcile(&self, filter: &UsageFilter) -> BillingResult<UsageReconciliation> {
        let ((local, record_count), server) =
            tokio::try_join!(self.local_total(filter), self.server_total(filter))?;

        Ok(UsageReconciliation {
            filter: *filter,
            mode: ReconcileMode::Verify,
            local: Some(local),
            record_count: Some(record_count),
            server,
        })
    }

    /// Aggregate according to `mode`.
    ///
    /// `Strict` turns a mismatch into `BillingError::ConsistencyMismatch`;
    /// `Verify` returns it inside the reconciliation for the caller to surface.
    pub async fn aggregate(
        &self,
        filter: &UsageFilter,
        mode: ReconcileMode,
    ) -> BillingResult<UsageReconciliation> {
        if !mode.computes_local() {
            let server = self.server_total(filter).await?;
            return Ok(UsageReconciliation {
                filter: *filter,
                mode,
                local: None,
                record_count: None,
                server,
            });
        }

        let mut reconciliation = self.reconcile(filter).await?;
        reconciliation.mode = mode;

        if let Some(mismatch) = reconciliation.mismatch() {
            tracing::warn!(
                subscription_id = %mismatch.subscription_id,
                window = %mismatch.window,
                local = mismatch.local,
                server = mismatch.server,
                difference = %mismatch.difference(),
                mode = %mode,
                "Usage aggregates disagree"
            );
            if mode == ReconcileMode::Strict {
                return Err((&mismatch).into());
            }
        }

        Ok(reconciliation)
    }
}
