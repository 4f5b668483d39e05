//! Quota resolution configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Default deadline callers put on one resolution (see QUOTA_RESOLVE_TIMEOUT_MS)
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 10_000;

/// Which usage aggregates are computed and how a disagreement is surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    /// Server aggregate only
    Server,
    /// Both aggregates; a mismatch is reported next to a status built from the server figure
    #[default]
    Verify,
    /// Both aggregates; a mismatch is an error and no status is produced
    Strict,
}

impl ReconcileMode {
    /// Whether the local ledger reduction runs at all
    pub fn computes_local(&self) -> bool {
        !matches!(self, ReconcileMode::Server)
    }
}

impl std::fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileMode::Server => write!(f, "server"),
            ReconcileMode::Verify => write!(f, "verify"),
            ReconcileMode::Strict => write!(f, "strict"),
        }
    }
}

impl std::str::FromStr for ReconcileMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "verify" => Ok(Self::Verify),
            "strict" => Ok(Self::Strict),
            _ => Err(BillingError::Config(format!(
                "Invalid reconcile mode: {} (expected server, verify or strict)",
                s
            ))),
        }
    }
}

/// Configuration for quota resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaConfig {
    /// How the two usage aggregates are reconciled
    pub reconcile_mode: ReconcileMode,
    /// Deadline callers should apply to one resolution via its cancellation token
    pub resolve_timeout: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reconcile_mode: ReconcileMode::default(),
            resolve_timeout: Duration::from_millis(DEFAULT_RESOLVE_TIMEOUT_MS),
        }
    }
}

impl QuotaConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup (environment, file, test map)
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let reconcile_mode = match lookup("QUOTA_RECONCILE_MODE") {
            Some(raw) => raw.parse()?,
            None => ReconcileMode::default(),
        };

        let resolve_timeout = match lookup("QUOTA_RESOLVE_TIMEOUT_MS") {
            Some(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|_| {
                    BillingError::Config(format!("QUOTA_RESOLVE_TIMEOUT_MS is not a number: {}", raw))
                })?;
                if ms == 0 {
                    return Err(BillingError::Config(
                        "QUOTA_RESOLVE_TIMEOUT_MS must be greater than zero".to_string(),
                    ));
                }
                Duration::from_millis(ms)
            }
            None => Duration::from_millis(DEFAULT_RESOLVE_TIMEOUT_MS),
        };

        Ok(Self {
            reconcile_mode,
            resolve_timeout,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = QuotaConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QuotaConfig::default());
        assert_eq!(config.reconcile_mode, ReconcileMode::Verify);
    }

    #[test]
    fn test_parses_mode_case_insensitively() {
        let config =
            QuotaConfig::from_lookup(lookup(&[("QUOTA_RECONCILE_MODE", " Strict ")])).unwrap();
        assert_eq!(config.reconcile_mode, ReconcileMode::Strict);
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let result = QuotaConfig::from_lookup(lookup(&[("QUOTA_RECONCILE_MODE", "close-enough")]));
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = QuotaConfig::from_lookup(lookup(&[("QUOTA_RESOLVE_TIMEOUT_MS", "0")]));
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    fn test_server_mode_skips_local() {
        assert!(!ReconcileMode::Server.computes_local());
        assert!(ReconcileMode::Verify.computes_local());
        assert!(ReconcileMode::Strict.computes_local());
    }
}
