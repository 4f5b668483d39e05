//! Billing error types

use botdesk_shared::SharedError;
use thiserror::Error;

/// Quota-resolution errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Entity absent upstream. "No active subscription" is a value, not this error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport or backend fault; safe for the caller to retry
    #[error("Data store unavailable: {0}")]
    Unavailable(String),

    /// Local ledger sum and server aggregate disagree for identical inputs
    #[error("Usage aggregates disagree: local sum {local} tokens, server aggregate {server} tokens")]
    ConsistencyMismatch { local: u64, server: u64 },

    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Quota resolution cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether retrying the same request could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Unavailable(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            // Rows that exist but cannot be decoded are bad data, not a bad connection
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                BillingError::DataIntegrity(err.to_string())
            }
            other => BillingError::Unavailable(other.to_string()),
        }
    }
}

impl From<SharedError> for BillingError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::Validation(msg) => BillingError::InvalidInput(msg),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pool_errors_are_retryable() {
        let err: BillingError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, BillingError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_mismatch_message_carries_both_values() {
        let err = BillingError::ConsistencyMismatch {
            local: 5_000_000,
            server: 4_998_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("5000000"));
        assert!(msg.contains("4998000"));
    }

    #[test]
    fn test_validation_maps_to_invalid_input() {
        let err: BillingError = SharedError::Validation("bad window".to_string()).into();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
}
