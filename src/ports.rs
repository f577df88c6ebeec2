//! Collaborator contracts
//!
//! The engine talks to the receipt service, the document store and local
//! preferences only through these traits. Every method is a suspension
//! point; nothing else in the engine awaits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::banners::BannerType;
use crate::billing::{CachedSnapshot, RemoteEntitlement, Resource, UsageRecord};
use crate::error::Result;

/// Status-authoritative receipt validation service
#[async_trait]
pub trait ReceiptValidator: Send + Sync {
    async fn fetch_receipt_status(&self, user_id: &str) -> Result<RemoteEntitlement>;
}

/// Remote document store holding the user's entitlement record and
/// historical flags
#[async_trait]
pub trait EntitlementDocumentStore: Send + Sync {
    async fn fetch_stored_entitlement(&self, user_id: &str) -> Result<RemoteEntitlement>;
}

/// Usage counters. `increment_usage` is called by the resource-consuming
/// collaborators, never by the engine.
#[async_trait]
pub trait UsageCounterStore: Send + Sync {
    async fn read_usage_counters(&self, user_id: &str) -> Result<UsageRecord>;

    async fn increment_usage(&self, user_id: &str, resource: Resource, amount: u64)
        -> Result<()>;

    /// Periodic reset of every counter
    async fn reset_usage(&self, user_id: &str) -> Result<()>;
}

/// One persisted row per banner type
#[async_trait]
pub trait DismissalStore: Send + Sync {
    async fn persist_dismissal(&self, banner: BannerType, at: DateTime<Utc>) -> Result<()>;

    async fn read_dismissal(&self, banner: BannerType) -> Result<Option<DateTime<Utc>>>;

    async fn clear_dismissal(&self, banner: BannerType) -> Result<()>;
}

/// Durable copy of the cached snapshot and its previous status
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self, user_id: &str) -> Result<Option<CachedSnapshot>>;

    async fn save_snapshot(&self, user_id: &str, snapshot: &CachedSnapshot) -> Result<()>;

    async fn delete_snapshot(&self, user_id: &str) -> Result<()>;
}
