//! Remote reconciliation
//!
//! Merges the receipt service, the document store and the cached snapshot
//! into one trusted `EntitlementState`.
//!
//! Flow:
//! 1. Fresh cached snapshot and no forced refresh: return it, no network
//! 2. Query both remote sources concurrently and wait for both to settle
//! 3. The authoritative source wins; the other one is only a fallback
//! 4. Normalize against the clock (past expiration => EXPIRED/FREE)
//! 5. OR the historical flags across both sources and the previous snapshot
//! 6. Replace the cached snapshot, persist it and publish events
//!
//! When both sources fail the last cached snapshot is re-normalized and
//! returned, or a FREE/NONE default when there is none. Reconciliation
//! never fails.

use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::subscription::{CachedSnapshot, StateCache};
use super::types::{EntitlementState, InvariantViolation, RemoteEntitlement, SubscriptionStatus};
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::events::{lifecycle_transitions, EngineEvent, EventBus, EventKind};
use crate::ports::{EntitlementDocumentStore, ReceiptValidator, SnapshotStore};

const RECEIPT_SOURCE: &str = "receipt service";
const DOCUMENT_SOURCE: &str = "document store";

/// Where a reconciled state came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    ReceiptService,
    DocumentStore,
    /// Within the freshness window, no remote call made
    FreshCache,
    /// Both sources failed; last known snapshot served
    StaleCache,
    /// Both sources failed and nothing was cached
    Default,
}

impl StateSource {
    /// True when the state could not be confirmed remotely
    pub fn is_degraded(self) -> bool {
        matches!(self, Self::StaleCache | Self::Default)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReceiptService => "receipt_service",
            Self::DocumentStore => "document_store",
            Self::FreshCache => "fresh_cache",
            Self::StaleCache => "stale_cache",
            Self::Default => "default",
        }
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub state: EntitlementState,
    pub source: StateSource,
    pub previous_status: Option<SubscriptionStatus>,
    /// Silent corrections applied during normalization
    pub corrections: Vec<InvariantViolation>,
}

impl ReconcileOutcome {
    fn from_snapshot(snapshot: CachedSnapshot, source: StateSource) -> Self {
        Self {
            state: snapshot.state,
            source,
            previous_status: snapshot.previous_status,
            corrections: Vec::new(),
        }
    }
}

/// Both remote answers of one pass; `None` where a source failed
#[derive(Debug, Clone, Default)]
pub struct RemoteFetch {
    pub receipt: Option<RemoteEntitlement>,
    pub stored: Option<RemoteEntitlement>,
}

/// Tunables for the reconciler
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    /// Bound on each remote fetch
    pub remote_timeout: std::time::Duration,
    pub grace_period: Duration,
    /// When false the document store is preferred over the receipt service
    pub receipt_authoritative: bool,
}

pub struct Reconciler {
    receipts: Arc<dyn ReceiptValidator>,
    documents: Arc<dyn EntitlementDocumentStore>,
    snapshots: Arc<dyn SnapshotStore>,
    cache: Arc<StateCache>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        receipts: Arc<dyn ReceiptValidator>,
        documents: Arc<dyn EntitlementDocumentStore>,
        snapshots: Arc<dyn SnapshotStore>,
        cache: Arc<StateCache>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            receipts,
            documents,
            snapshots,
            cache,
            bus,
            clock,
            settings,
        }
    }

    /// Reconcile a user's entitlement. Always yields a usable state.
    pub async fn reconcile(&self, user_id: &str, force_refresh: bool) -> ReconcileOutcome {
        self.hydrate(user_id).await;

        if !force_refresh {
            if let Some(snapshot) = self.cache.get_fresh(user_id, self.clock.now()) {
                debug!(user_id = user_id, "Serving fresh cached entitlement");
                return ReconcileOutcome::from_snapshot(snapshot, StateSource::FreshCache);
            }
        }

        let fetched = self.fetch_remote(user_id).await;
        self.apply(user_id, fetched, force_refresh).await
    }

    /// Query both remote sources concurrently and wait for both to settle.
    /// Has no side effects on the cache.
    pub async fn fetch_remote(&self, user_id: &str) -> RemoteFetch {
        let timeout = self.settings.remote_timeout;
        let (receipt, stored) = tokio::join!(
            bounded(RECEIPT_SOURCE, timeout, self.receipts.fetch_receipt_status(user_id)),
            bounded(DOCUMENT_SOURCE, timeout, self.documents.fetch_stored_entitlement(user_id)),
        );
        if let Err(e) = &receipt {
            warn!(user_id = user_id, error = %e, "Receipt validation unavailable");
        }
        if let Err(e) = &stored {
            warn!(user_id = user_id, error = %e, "Stored entitlement unavailable");
        }

        RemoteFetch {
            receipt: receipt.ok(),
            stored: stored.ok(),
        }
    }

    /// Merge fetched answers into the cache, or fall back when neither
    /// source answered.
    pub async fn apply(&self, user_id: &str, fetched: RemoteFetch, forced: bool) -> ReconcileOutcome {
        self.hydrate(user_id).await;

        let RemoteFetch { receipt, stored } = fetched;
        let (primary, secondary) = if self.settings.receipt_authoritative {
            (
                receipt.as_ref().map(|r| (r, StateSource::ReceiptService)),
                stored.as_ref().map(|r| (r, StateSource::DocumentStore)),
            )
        } else {
            (
                stored.as_ref().map(|r| (r, StateSource::DocumentStore)),
                receipt.as_ref().map(|r| (r, StateSource::ReceiptService)),
            )
        };

        let Some((winner, source)) = primary.or(secondary) else {
            return self.fallback(user_id).await;
        };

        let previous = self.cache.get_any(user_id);
        let merged = merge(winner, [receipt.as_ref(), stored.as_ref()], previous.as_ref());

        let now = self.clock.now();
        let (state, corrections) = merged.normalize(now, self.settings.grace_period);
        for correction in &corrections {
            warn!(user_id = user_id, source = source.as_str(), "Corrected entitlement: {}", correction);
        }

        let snapshot = self.commit(user_id, state, now, now).await;
        self.bus.publish(
            EngineEvent::new(EventKind::StateRefreshed, snapshot.state.clone(), "reconcile", now)
                .with_metadata("source", source.as_str())
                .with_metadata("forced", forced.to_string()),
        );

        debug!(
            user_id = user_id,
            source = source.as_str(),
            entitlement = %snapshot.state.entitlement,
            status = %snapshot.state.subscription_status,
            "Reconciled entitlement"
        );

        ReconcileOutcome {
            state: snapshot.state,
            source,
            previous_status: snapshot.previous_status,
            corrections,
        }
    }

    /// Stale-but-available state used when both sources fail or time out.
    ///
    /// The cached snapshot is re-normalized against the clock, so a plan
    /// that lapsed while offline is served as EXPIRED/FREE.
    pub async fn fallback(&self, user_id: &str) -> ReconcileOutcome {
        self.hydrate(user_id).await;

        let Some(cached) = self.cache.get_any(user_id) else {
            warn!(user_id = user_id, "Remote sources unavailable and nothing cached, assuming free tier");
            return ReconcileOutcome {
                state: EntitlementState::free(),
                source: StateSource::Default,
                previous_status: None,
                corrections: Vec::new(),
            };
        };

        let now = self.clock.now();
        let (state, corrections) = cached.state.clone().normalize(now, self.settings.grace_period);
        if corrections.is_empty() {
            info!(user_id = user_id, "Remote sources unavailable, serving cached entitlement");
            return ReconcileOutcome::from_snapshot(cached, StateSource::StaleCache);
        }

        for correction in &corrections {
            warn!(user_id = user_id, "Corrected cached entitlement: {}", correction);
        }
        // Original cached_at kept so the next read still goes remote
        let snapshot = self.commit(user_id, state, cached.cached_at, now).await;
        ReconcileOutcome {
            state: snapshot.state,
            source: StateSource::StaleCache,
            previous_status: snapshot.previous_status,
            corrections,
        }
    }

    /// Replace the cached snapshot, persist it and publish derived
    /// lifecycle events
    async fn commit(
        &self,
        user_id: &str,
        state: EntitlementState,
        cached_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CachedSnapshot {
        let (snapshot, replaced) = self.cache.store(user_id, state, cached_at);
        if let Err(e) = self.snapshots.save_snapshot(user_id, &snapshot).await {
            warn!(user_id = user_id, error = %e, "Failed to persist entitlement snapshot");
        }

        for kind in lifecycle_transitions(replaced.as_ref(), &snapshot.state) {
            self.bus
                .publish(EngineEvent::new(kind, snapshot.state.clone(), "reconcile", now));
        }
        snapshot
    }

    /// Load the persisted snapshot into a cold cache
    async fn hydrate(&self, user_id: &str) {
        if self.cache.get_any(user_id).is_some() {
            return;
        }
        match self.snapshots.load_snapshot(user_id).await {
            Ok(Some(snapshot)) => {
                if self.cache.hydrate(user_id, snapshot) {
                    debug!(user_id = user_id, "Hydrated entitlement cache from disk");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(user_id = user_id, error = %e, "Failed to load persisted snapshot"),
        }
    }
}

/// Apply a per-source time bound
async fn bounded<F>(
    source_name: &'static str,
    limit: std::time::Duration,
    fetch: F,
) -> Result<RemoteEntitlement>
where
    F: Future<Output = Result<RemoteEntitlement>>,
{
    match tokio::time::timeout(limit, fetch).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            source_name,
            after: limit,
        }),
    }
}

/// Build the merged state from the winning record, with historical flags
/// OR-ed across every source that answered and the previous snapshot.
fn merge<'a>(
    winner: &RemoteEntitlement,
    answered: [Option<&'a RemoteEntitlement>; 2],
    previous: Option<&CachedSnapshot>,
) -> EntitlementState {
    let mut state = EntitlementState::from_remote(winner);
    for remote in answered.into_iter().flatten() {
        let implied = EntitlementState::from_remote(remote);
        state = state.with_history(implied.has_ever_used_trial, implied.has_ever_used_premium);
    }
    if let Some(previous) = previous {
        state = state.with_history(
            previous.state.has_ever_used_trial,
            previous.state.has_ever_used_premium,
        );
    }
    state
}
