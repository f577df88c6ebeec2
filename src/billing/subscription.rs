//! Entitlement snapshot cache
//!
//! Holds the last reconciled state per user together with the status that
//! preceded it. Each write replaces the whole entry under one lock, so a
//! reader sees either the old snapshot or the new one, never a mix.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use super::types::{EntitlementState, SubscriptionStatus};

/// Helper to acquire read lock with poison recovery
fn acquire_read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned: PoisonError<RwLockReadGuard<'_, T>>| {
        warn!("RwLock was poisoned on read, recovering inner value");
        poisoned.into_inner()
    })
}

/// Helper to acquire write lock with poison recovery
fn acquire_write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned: PoisonError<RwLockWriteGuard<'_, T>>| {
        warn!("RwLock was poisoned on write, recovering inner value");
        poisoned.into_inner()
    })
}

/// One cached snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSnapshot {
    pub state: EntitlementState,
    /// Status in force before the most recent status change. `None` until a
    /// change has been observed.
    pub previous_status: Option<SubscriptionStatus>,
    pub cached_at: DateTime<Utc>,
}

impl CachedSnapshot {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.cached_at
    }
}

/// Process-local cache with a freshness window
pub struct StateCache {
    entries: RwLock<HashMap<String, CachedSnapshot>>,
    freshness: Duration,
}

impl StateCache {
    pub fn new(freshness: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            freshness,
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Snapshot younger than the freshness window, if any
    pub fn get_fresh(&self, user_id: &str, now: DateTime<Utc>) -> Option<CachedSnapshot> {
        let entries = acquire_read_lock(&self.entries);
        entries
            .get(user_id)
            .filter(|snap| snap.age(now) < self.freshness)
            .cloned()
    }

    /// Snapshot regardless of age (stale-but-available fallback)
    pub fn get_any(&self, user_id: &str) -> Option<CachedSnapshot> {
        acquire_read_lock(&self.entries).get(user_id).cloned()
    }

    /// Replace the snapshot for a user.
    ///
    /// Returns the new entry and the state it replaced. The previous status
    /// only moves when the status actually changes, so it does not depend on
    /// how many reconciliations happened in between.
    pub fn store(
        &self,
        user_id: &str,
        state: EntitlementState,
        now: DateTime<Utc>,
    ) -> (CachedSnapshot, Option<EntitlementState>) {
        let mut entries = acquire_write_lock(&self.entries);
        let replaced = entries.remove(user_id);

        let previous_status = match &replaced {
            Some(old) if old.state.subscription_status != state.subscription_status => {
                Some(old.state.subscription_status)
            }
            Some(old) => old.previous_status,
            None => None,
        };

        let snapshot = CachedSnapshot {
            state,
            previous_status,
            cached_at: now,
        };
        debug!(
            user_id = user_id,
            status = %snapshot.state.subscription_status,
            previous = ?snapshot.previous_status,
            "Caching entitlement snapshot"
        );
        entries.insert(user_id.to_string(), snapshot.clone());

        (snapshot, replaced.map(|old| old.state))
    }

    /// Seed the cache from persisted storage. An entry already in memory wins.
    pub fn hydrate(&self, user_id: &str, snapshot: CachedSnapshot) -> bool {
        let mut entries = acquire_write_lock(&self.entries);
        if entries.contains_key(user_id) {
            return false;
        }
        entries.insert(user_id.to_string(), snapshot);
        true
    }

    /// Force the next read to go remote while keeping the fallback copy
    pub fn invalidate(&self, user_id: &str) {
        let mut entries = acquire_write_lock(&self.entries);
        if let Some(snapshot) = entries.get_mut(user_id) {
            snapshot.cached_at = DateTime::<Utc>::MIN_UTC;
        }
    }

    /// Clear cache for a user (on logout)
    pub fn clear(&self, user_id: &str) {
        acquire_write_lock(&self.entries).remove(user_id);
        debug!(user_id = user_id, "Cleared entitlement cache");
    }
}
