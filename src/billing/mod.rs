//! Entitlement and quota bookkeeping
//!
//! This module handles:
//! - Entitlement state and its invariants (Free/Premium, subscription status)
//! - Per-user snapshot caching with a freshness window
//! - Reconciliation of the receipt service and the document store
//! - Usage counters and plan limit checks

mod limits;
mod reconciler;
mod subscription;
mod types;
mod usage;

pub use limits::{LimitStatus, PlanLimits, PlanLimitsTable, ResourceStatus, UsageQuotaTracker};
pub use reconciler::{ReconcileOutcome, Reconciler, ReconcilerSettings, RemoteFetch, StateSource};
pub use subscription::{CachedSnapshot, StateCache};
pub use types::{
    Entitlement, EntitlementState, InvariantViolation, RawEntitlementRecord, RawTimestamp,
    RemoteEntitlement, SubscriptionStatus, SubscriptionType,
};
pub use usage::{Resource, UsageCounter, UsageRecord};
