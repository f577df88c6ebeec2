//! Entitlement engine facade
//!
//! The one object hosts hold per signed-in user. Every entry point
//! returns a usable value; remote and storage failures degrade to the
//! cached or FREE state and are logged.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::banners::{BannerDecision, BannerEngine, BannerType};
use crate::billing::{
    EntitlementState, LimitStatus, Reconciler, ReconcilerSettings, StateCache, UsageQuotaTracker,
    UsageRecord,
};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus, EventKind, EventSubscription};
use crate::ports::{
    DismissalStore, EntitlementDocumentStore, ReceiptValidator, SnapshotStore, UsageCounterStore,
};
use crate::storage::LocalStore;
use crate::supervisor::{OperationSupervisor, Progress, SupervisedOutcome};


/// Supervisor slot used by forced refreshes
pub const RECONCILE_SLOT: &str = "reconcile";

/// Storage handles and remote sources the engine is built from
#[derive(Clone)]
pub struct Collaborators {
    pub receipts: Arc<dyn ReceiptValidator>,
    pub documents: Arc<dyn EntitlementDocumentStore>,
    pub usage: Arc<dyn UsageCounterStore>,
    pub dismissals: Arc<dyn DismissalStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl Collaborators {
    /// Use one local store for counters, dismissals and snapshots
    pub fn with_store<S>(
        receipts: Arc<dyn ReceiptValidator>,
        documents: Arc<dyn EntitlementDocumentStore>,
        store: Arc<S>,
    ) -> Self
    where
        S: UsageCounterStore + DismissalStore + SnapshotStore + 'static,
    {
        Self {
            receipts,
            documents,
            usage: store.clone(),
            dismissals: store.clone(),
            snapshots: store,
        }
    }
}

/// A store-billing notification forwarded by the host
#[derive(Debug, Clone, Default)]
pub struct WebhookNotification {
    pub event_type: String,
    pub metadata: HashMap<String, String>,
}

impl WebhookNotification {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn is_refund(&self) -> bool {
        matches!(
            self.event_type.to_ascii_lowercase().as_str(),
            "refund" | "refunded" | "refund_issued"
        )
    }
}

pub struct EntitlementEngine {
    user_id: String,
    config: EngineConfig,
    cache: Arc<StateCache>,
    reconciler: Arc<Reconciler>,
    tracker: UsageQuotaTracker,
    banners: BannerEngine,
    bus: Arc<EventBus>,
    supervisor: OperationSupervisor,
    usage: Arc<dyn UsageCounterStore>,
    snapshots: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
}

impl EntitlementEngine {
    pub fn new(user_id: impl Into<String>, collaborators: Collaborators, config: EngineConfig) -> Self {
        Self::with_clock(user_id, collaborators, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        user_id: impl Into<String>,
        collaborators: Collaborators,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(StateCache::new(config.freshness_window()));
        let bus = Arc::new(EventBus::new(config.event_capacity, config.event_history));
        let reconciler = Arc::new(Reconciler::new(
            collaborators.receipts,
            collaborators.documents,
            collaborators.snapshots.clone(),
            cache.clone(),
            bus.clone(),
            clock.clone(),
            ReconcilerSettings {
                remote_timeout: config.remote_timeout(),
                grace_period: config.grace_period(),
                receipt_authoritative: config.receipt_authoritative,
            },
        ));
        let tracker = UsageQuotaTracker::new(
            config.plan_limits.clone(),
            config.usage_buffer_percent,
            config.usage_warning_percent,
            config.grace_period(),
            clock.clone(),
        );

        Self {
            user_id: user_id.into(),
            supervisor: OperationSupervisor::new(config.progress_thresholds_secs.clone()),
            banners: BannerEngine::new(collaborators.dismissals, clock.clone()),
            usage: collaborators.usage,
            snapshots: collaborators.snapshots,
            config,
            cache,
            reconciler,
            tracker,
            bus,
            clock,
        }
    }

    /// Engine backed by the SQLite store at `config.database_path()`
    pub fn open_local(
        user_id: impl Into<String>,
        receipts: Arc<dyn ReceiptValidator>,
        documents: Arc<dyn EntitlementDocumentStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        let store = Arc::new(LocalStore::open(&config.database_path()?)?);
        let collaborators = Collaborators::with_store(receipts, documents, store);
        Ok(Self::new(user_id, collaborators, config))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current entitlement; cached within the freshness window unless forced
    pub async fn get_entitlement_state(&self, force_refresh: bool) -> EntitlementState {
        self.reconciler.reconcile(&self.user_id, force_refresh).await.state
    }

    /// Forced refresh under the supervisor.
    ///
    /// `on_progress` fires once per second. Only the remote fetch runs under
    /// the supervisor; its answers are applied after it completes. On
    /// timeout, or if a refresh is already running, the cached (or FREE)
    /// state is returned and a late fetch result is dropped unapplied.
    pub async fn refresh_with_progress<P>(&self, on_progress: P) -> EntitlementState
    where
        P: FnMut(Progress),
    {
        let reconciler = self.reconciler.clone();
        let user_id = self.user_id.clone();
        let outcome = self
            .supervisor
            .run(
                RECONCILE_SLOT,
                self.config.operation_timeout(),
                async move { reconciler.fetch_remote(&user_id).await },
                on_progress,
                |after| {
                    warn!(user_id = %self.user_id, ?after, "Entitlement refresh timed out, using cached state")
                },
            )
            .await;

        match outcome {
            SupervisedOutcome::Completed(fetched) => {
                self.reconciler.apply(&self.user_id, fetched, true).await.state
            }
            _ => self.reconciler.fallback(&self.user_id).await.state,
        }
    }

    pub fn is_refresh_running(&self) -> bool {
        self.supervisor.is_active(RECONCILE_SLOT)
    }

    /// Usage against the effective plan limits
    pub async fn check_usage_limits(&self, with_buffer: bool) -> LimitStatus {
        let state = self.get_entitlement_state(false).await;
        let usage = self.read_usage().await;
        self.tracker.check_limits(&state, &usage, with_buffer)
    }

    async fn read_usage(&self) -> UsageRecord {
        match self.usage.read_usage_counters(&self.user_id).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Failed to read usage counters, assuming none");
                UsageRecord::empty(&self.user_id)
            }
        }
    }

    /// Evaluate every banner; at most one is surfaced
    pub async fn banner_decision(&self) -> BannerDecision {
        // Refresh if stale so the snapshot's previous status is current
        self.get_entitlement_state(false).await;
        let snapshot = self.cache.get_any(&self.user_id);
        let limits = self.check_usage_limits(false).await;
        self.banners.evaluate(snapshot.as_ref(), Some(&limits)).await
    }

    pub async fn should_show_banner(&self, banner: BannerType) -> bool {
        self.banner_decision().await.should_show(banner)
    }

    /// Persist a dismissal. Returns false if the store rejected it.
    pub async fn dismiss_banner(&self, banner: BannerType) -> bool {
        self.banners.dismiss(banner).await
    }

    /// Clear a dismissal (diagnostic)
    pub async fn reset_banner(&self, banner: BannerType) -> bool {
        self.banners.reset(banner).await
    }

    /// Subscribe to lifecycle events; `None` receives every kind
    pub fn subscribe(&self, kind: Option<EventKind>) -> EventSubscription {
        self.bus.subscribe(kind)
    }

    /// Shared bus, for collaborators that publish purchase events
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Forward a billing notification and re-reconcile.
    ///
    /// Publishes `WebhookReceived`, forces a refresh (which publishes any
    /// derived lifecycle event) and, for refunds, `Refunded` with the
    /// refreshed state.
    pub async fn handle_webhook(&self, notification: WebhookNotification) -> EntitlementState {
        info!(user_id = %self.user_id, event_type = %notification.event_type, "Webhook received");
        let before = self
            .cache
            .get_any(&self.user_id)
            .map(|snapshot| snapshot.state)
            .unwrap_or_default();

        let mut received = EngineEvent::new(
            EventKind::WebhookReceived,
            before,
            "webhook",
            self.clock.now(),
        )
        .with_metadata("eventType", notification.event_type.clone());
        received.metadata.extend(notification.metadata.clone());
        self.bus.publish(received);

        self.cache.invalidate(&self.user_id);
        let state = self.get_entitlement_state(true).await;

        if notification.is_refund() {
            let mut refunded =
                EngineEvent::new(EventKind::Refunded, state.clone(), "webhook", self.clock.now());
            refunded.metadata = notification.metadata;
            self.bus.publish(refunded);
        }
        state
    }

    /// Periodic counter reset. Also re-arms the usage-limit banner.
    pub async fn reset_usage(&self) -> bool {
        if let Err(e) = self.usage.reset_usage(&self.user_id).await {
            warn!(user_id = %self.user_id, error = %e, "Failed to reset usage counters");
            return false;
        }
        info!(user_id = %self.user_id, "Usage counters reset");
        self.banners.reset(BannerType::UsageLimit).await
    }

    /// Drop the memory and persisted snapshot (logout)
    pub async fn clear_cached_state(&self) {
        self.cache.clear(&self.user_id);
        if let Err(e) = self.snapshots.delete_snapshot(&self.user_id).await {
            warn!(user_id = %self.user_id, error = %e, "Failed to delete persisted snapshot");
        }
        info!(user_id = %self.user_id, "Cleared cached entitlement");
    }

    /// Neither a trial nor a paid plan was ever used
    pub async fn is_trial_offer_eligible(&self) -> bool {
        self.get_entitlement_state(false)
            .await
            .is_trial_offer_eligible()
    }

    /// Premium right now, re-derived from the full state
    pub async fn is_premium(&self) -> bool {
        self.get_entitlement_state(false)
            .await
            .is_premium(self.clock.now(), self.config.grace_period())
    }

    /// Recent events for diagnostics; never replayed into subscriptions
    pub fn recent_events(&self) -> Vec<EngineEvent> {
        self.bus.recent()
    }
}
