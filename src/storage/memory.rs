//! In-memory implementation of the local ports
//!
//! Used by tests and by hosts that keep nothing on disk. Uses DashMap so
//! the store can be shared behind an `Arc` without a global lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::banners::BannerType;
use crate::billing::{CachedSnapshot, Resource, UsageRecord};
use crate::error::Result;
use crate::ports::{DismissalStore, SnapshotStore, UsageCounterStore};

#[derive(Default)]
pub struct MemoryStore {
    usage: DashMap<String, UsageRecord>,
    dismissals: DashMap<BannerType, DateTime<Utc>>,
    snapshots: DashMap<String, CachedSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageCounterStore for MemoryStore {
    async fn read_usage_counters(&self, user_id: &str) -> Result<UsageRecord> {
        Ok(self
            .usage
            .get(user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| UsageRecord::empty(user_id)))
    }

    async fn increment_usage(&self, user_id: &str, resource: Resource, amount: u64) -> Result<()> {
        self.usage
            .entry(user_id.to_string())
            .or_insert_with(|| UsageRecord::empty(user_id))
            .increment(resource, amount, Utc::now());
        Ok(())
    }

    async fn reset_usage(&self, user_id: &str) -> Result<()> {
        self.usage.remove(user_id);
        Ok(())
    }
}

#[async_trait]
impl DismissalStore for MemoryStore {
    async fn persist_dismissal(&self, banner: BannerType, at: DateTime<Utc>) -> Result<()> {
        self.dismissals.insert(banner, at);
        Ok(())
    }

    async fn read_dismissal(&self, banner: BannerType) -> Result<Option<DateTime<Utc>>> {
        Ok(self.dismissals.get(&banner).map(|entry| *entry.value()))
    }

    async fn clear_dismissal(&self, banner: BannerType) -> Result<()> {
        self.dismissals.remove(&banner);
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load_snapshot(&self, user_id: &str) -> Result<Option<CachedSnapshot>> {
        Ok(self.snapshots.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn save_snapshot(&self, user_id: &str, snapshot: &CachedSnapshot) -> Result<()> {
        self.snapshots.insert(user_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn delete_snapshot(&self, user_id: &str) -> Result<()> {
        self.snapshots.remove(user_id);
        Ok(())
    }
}
