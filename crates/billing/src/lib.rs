//! Botdesk Billing: usage-based subscription quota resolution
//!
//! Given a company, determine its authoritative subscription, the plan's token
//! quota, how much of it has been consumed, and whether the two independent
//! usage computations agree.

pub mod admission;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ledger;
pub mod quota;
pub mod resolver;
pub mod service;
pub mod store;
pub mod usage;

pub use admission::{admit, Admission, AdmissionDecision, DenialReason};
pub use catalog::PlanCatalog;
pub use config::{QuotaConfig, ReconcileMode};
pub use error::{BillingError, BillingResult};
pub use ledger::UsageLedger;
pub use quota::{evaluate, LifecycleStatus, QuotaStatus};
pub use resolver::{select_current, MultipleActiveSubscriptions, ResolvedSubscription, SubscriptionResolver};
pub use service::{QuotaDiagnostic, QuotaReport, QuotaResolution, QuotaService, QuotaWindow};
pub use store::{PgQuotaStore, QuotaStore};
pub use usage::{sum_tokens, ConsistencyMismatch, UsageAggregator, UsageReconciliation};
