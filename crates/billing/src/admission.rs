//! Admission check
//!
//! Answers "may this company spend `requested` more tokens right now?" against
//! the current billing period. Usage is not recorded here; the metering
//! pipeline owns the ledger.

use botdesk_shared::CompanyId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::BillingResult;
use crate::quota::{LifecycleStatus, QuotaStatus};
use crate::service::{QuotaDiagnostic, QuotaResolution, QuotaService};

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    /// `tokens_used + requested` would exceed `token_limit`
    LimitExceeded {
        tokens_used: u64,
        requested: u64,
        token_limit: u64,
    },
    /// Subscription is not in the `Active` lifecycle state
    NotActive { lifecycle: LifecycleStatus },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::LimitExceeded {
                tokens_used,
                requested,
                token_limit,
            } => write!(
                f,
                "token limit exceeded: {} used + {} requested > {} limit",
                tokens_used, requested, token_limit
            ),
            DenialReason::NotActive { lifecycle } => {
                write!(f, "subscription is {}", lifecycle)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Allowed { remaining_after: u64 },
    Denied(DenialReason),
    NoSubscription,
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed { .. })
    }
}

/// Admission decision plus any divergence seen while resolving the quota it
/// was made against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub decision: AdmissionDecision,
    pub diagnostics: Vec<QuotaDiagnostic>,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }

    /// No invariant divergence was observed
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Pure decision for one request against a quota status
pub fn admit(status: &QuotaStatus, requested: u64) -> AdmissionDecision {
    if !status.lifecycle.is_active() {
        return AdmissionDecision::Denied(DenialReason::NotActive {
            lifecycle: status.lifecycle,
        });
    }

    match status.tokens_used.checked_add(requested) {
        Some(total) if total <= status.token_limit => AdmissionDecision::Allowed {
            remaining_after: status.token_limit - total,
        },
        _ => AdmissionDecision::Denied(DenialReason::LimitExceeded {
            tokens_used: status.tokens_used,
            requested,
            token_limit: status.token_limit,
        }),
    }
}

impl QuotaService {
    /// Decide whether `company_id` may consume `requested` more tokens in its
    /// current subscription period. Diagnostics from the resolution are
    /// returned with the decision whichever way it goes.
    pub async fn check_admission(
        &self,
        company_id: CompanyId,
        requested: u64,
        cancel: &CancellationToken,
    ) -> BillingResult<Admission> {
        let (decision, diagnostics) = match self.resolve_current_period(company_id, cancel).await? {
            QuotaResolution::NoSubscription { .. } => (AdmissionDecision::NoSubscription, Vec::new()),
            QuotaResolution::Resolved(report) => {
                (admit(&report.status, requested), report.diagnostics)
            }
        };

        if let AdmissionDecision::Denied(reason) = &decision {
            tracing::info!(
                company_id = %company_id,
                requested = requested,
                reason = %reason,
                "Admission denied"
            );
        }
        if !diagnostics.is_empty() {
            tracing::warn!(
                company_id = %company_id,
                requested = requested,
                allowed = decision.is_allowed(),
                diagnostics = diagnostics.len(),
                "Admission decided against a quota with diagnostics"
            );
        }

        Ok(Admission {
            decision,
            diagnostics,
        })
    }
}
