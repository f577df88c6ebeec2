//! SQLite-backed local store
//!
//! Persists usage counters, banner dismissals and the last entitlement
//! snapshot so they survive restarts. Counters are updated with atomic
//! upserts.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::banners::BannerType;
use crate::billing::{CachedSnapshot, Resource, UsageCounter, UsageRecord};
use crate::error::{EngineError, Result};
use crate::ports::{DismissalStore, SnapshotStore, UsageCounterStore};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS usage_counters (
        user_id TEXT NOT NULL,
        resource TEXT NOT NULL,
        value INTEGER NOT NULL DEFAULT 0,
        last_updated INTEGER,
        PRIMARY KEY (user_id, resource)
    );

    CREATE TABLE IF NOT EXISTS banner_dismissals (
        banner_type TEXT PRIMARY KEY,
        dismissed_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS entitlement_snapshots (
        user_id TEXT PRIMARY KEY,
        snapshot TEXT NOT NULL,
        cached_at INTEGER NOT NULL
    );
"#;

/// SQLite local store
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Create or open the database at `path`, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Storage(format!("Failed to create data dir: {}", e))
            })?;
        }

        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened local store");
        Self::with_connection(conn)
    }

    /// Store that lives only as long as the process
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Local store mutex was poisoned, recovering connection");
            poisoned.into_inner()
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| EngineError::Storage(format!("Invalid timestamp in store: {}", ms)))
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl UsageCounterStore for LocalStore {
    async fn read_usage_counters(&self, user_id: &str) -> Result<UsageRecord> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT resource, value, last_updated FROM usage_counters WHERE user_id = ?",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;

        let mut usage = UsageRecord::empty(user_id);
        for row in rows {
            let (resource, value, last_updated) = row?;
            let resource: Resource = match resource.parse() {
                Ok(r) => r,
                Err(e) => {
                    warn!(user_id = user_id, error = %e, "Skipping unknown usage column");
                    continue;
                }
            };
            let counter = UsageCounter {
                value: value.max(0) as u64,
                last_updated: last_updated.map(from_millis).transpose()?,
            };
            match resource {
                Resource::PagesProcessed => usage.pages_processed = counter,
                Resource::SpeechRequests => usage.speech_requests = counter,
                Resource::TranslatedCharacters => usage.translated_characters = counter,
                Resource::StorageBytes => usage.storage_bytes = counter,
            }
        }
        Ok(usage)
    }

    async fn increment_usage(&self, user_id: &str, resource: Resource, amount: u64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO usage_counters (user_id, resource, value, last_updated)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, resource) DO UPDATE SET
                value = value + excluded.value,
                last_updated = excluded.last_updated
            "#,
            params![
                user_id,
                resource.as_str(),
                to_sql_count(amount),
                to_millis(Utc::now())
            ],
        )?;

        debug!(user = user_id, resource = %resource, amount, "Incremented usage");
        Ok(())
    }

    async fn reset_usage(&self, user_id: &str) -> Result<()> {
        let deleted = self
            .conn()
            .execute("DELETE FROM usage_counters WHERE user_id = ?", params![user_id])?;
        debug!(user = user_id, deleted, "Reset usage counters");
        Ok(())
    }
}

#[async_trait]
impl DismissalStore for LocalStore {
    async fn persist_dismissal(&self, banner: BannerType, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO banner_dismissals (banner_type, dismissed_at) VALUES (?1, ?2)",
            params![banner.as_str(), to_millis(at)],
        )?;
        Ok(())
    }

    async fn read_dismissal(&self, banner: BannerType) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> = self
            .conn()
            .query_row(
                "SELECT dismissed_at FROM banner_dismissals WHERE banner_type = ?",
                params![banner.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        ms.map(from_millis).transpose()
    }

    async fn clear_dismissal(&self, banner: BannerType) -> Result<()> {
        self.conn().execute(
            "DELETE FROM banner_dismissals WHERE banner_type = ?",
            params![banner.as_str()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for LocalStore {
    async fn load_snapshot(&self, user_id: &str) -> Result<Option<CachedSnapshot>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT snapshot FROM entitlement_snapshots WHERE user_id = ?",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_snapshot(&self, user_id: &str, snapshot: &CachedSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.conn().execute(
            r#"
            INSERT INTO entitlement_snapshots (user_id, snapshot, cached_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                cached_at = excluded.cached_at
            "#,
            params![user_id, json, to_millis(snapshot.cached_at)],
        )?;
        Ok(())
    }

    async fn delete_snapshot(&self, user_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM entitlement_snapshots WHERE user_id = ?",
            params![user_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{EntitlementState, SubscriptionStatus};
    use chrono::SubsecRound;

    #[tokio::test]
    async fn test_usage_tracking() {
        let store = LocalStore::open_in_memory().unwrap();
        let user_id = "test_user_123";

        let usage = store.read_usage_counters(user_id).await.unwrap();
        assert_eq!(usage.get(Resource::PagesProcessed), 0);

        store.increment_usage(user_id, Resource::PagesProcessed, 2).await.unwrap();
        store.increment_usage(user_id, Resource::PagesProcessed, 1).await.unwrap();
        store
            .increment_usage(user_id, Resource::TranslatedCharacters, 1200)
            .await
            .unwrap();

        let usage = store.read_usage_counters(user_id).await.unwrap();
        assert_eq!(usage.get(Resource::PagesProcessed), 3);
        assert_eq!(usage.get(Resource::TranslatedCharacters), 1200);
        assert!(usage.pages_processed.last_updated.is_some());
        assert_eq!(usage.get(Resource::StorageBytes), 0);

        // Other users are untouched
        let other = store.read_usage_counters("someone_else").await.unwrap();
        assert_eq!(other.get(Resource::PagesProcessed), 0);

        store.reset_usage(user_id).await.unwrap();
        let usage = store.read_usage_counters(user_id).await.unwrap();
        assert_eq!(usage.get(Resource::PagesProcessed), 0);
    }

    #[tokio::test]
    async fn test_dismissals_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.db");
        let at = Utc::now().trunc_subsecs(3);

        {
            let store = LocalStore::open(&path).unwrap();
            store.persist_dismissal(BannerType::TrialCompleted, at).await.unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(
            store.read_dismissal(BannerType::TrialCompleted).await.unwrap(),
            Some(at)
        );
        assert!(store.read_dismissal(BannerType::PremiumExpired).await.unwrap().is_none());

        store.clear_dismissal(BannerType::TrialCompleted).await.unwrap();
        assert!(store.read_dismissal(BannerType::TrialCompleted).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_persistence() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(store.load_snapshot("u").await.unwrap().is_none());

        let snapshot = CachedSnapshot {
            state: EntitlementState {
                subscription_status: SubscriptionStatus::Expired,
                has_ever_used_trial: true,
                ..Default::default()
            },
            previous_status: Some(SubscriptionStatus::Trial),
            cached_at: Utc::now(),
        };
        store.save_snapshot("u", &snapshot).await.unwrap();
        store.save_snapshot("u", &snapshot).await.unwrap();

        let loaded = store.load_snapshot("u").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);

        store.delete_snapshot("u").await.unwrap();
        assert!(store.load_snapshot("u").await.unwrap().is_none());
    }
}
