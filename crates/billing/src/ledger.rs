//! Usage ledger reader
//!
//! Fetches raw usage rows for one subscription and billing window. The store is
//! trusted for transport, not for content: every row is checked against the
//! filter it was requested with.

use botdesk_shared::{UsageFilter, UsageRecord};
use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::store::QuotaStore;

#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn QuotaStore>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// Read the usage rows matching `filter`, ordered by (timestamp, id).
    ///
    /// An empty ledger is success; `NotFound` only when the subscription itself
    /// is unknown upstream.
    pub async fn read(&self, filter: &UsageFilter) -> BillingResult<Vec<UsageRecord>> {
        let mut records = self.store.list_usage_records(filter).await?;
        verify_records(filter, &records)?;
        records.sort_by_key(|r| (r.timestamp, r.id));

        tracing::debug!(
            subscription_id = %filter.subscription_id,
            window = %filter.window,
            records = records.len(),
            "UsageLedger::read: ledger fetched"
        );

        Ok(records)
    }
}

/// Reject rows that do not belong to the filter or carry negative token counts
pub fn verify_records(filter: &UsageFilter, records: &[UsageRecord]) -> BillingResult<()> {
    for record in records {
        if record.subscription_id != filter.subscription_id {
            return Err(BillingError::DataIntegrity(format!(
                "usage record {} belongs to subscription {}, requested {}",
                record.id, record.subscription_id, filter.subscription_id
            )));
        }
        if !filter.window.contains(record.timestamp) {
            return Err(BillingError::DataIntegrity(format!(
                "usage record {} at {} is outside billing window {}",
                record.id, record.timestamp, filter.window
            )));
        }
        if record.total_tokens < 0 {
            return Err(BillingError::DataIntegrity(format!(
                "usage record {} has negative total_tokens {}",
                record.id, record.total_tokens
            )));
        }
    }
    Ok(())
}
