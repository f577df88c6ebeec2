//! Banner decision engine
//!
//! Decides which user-facing notification may show. Each banner type is
//! evaluated independently into ELIGIBLE, DISMISSED or NOT_APPLICABLE, then
//! only the highest-priority eligible banner is surfaced.
//!
//! Trial-completed and premium-expired are edge-triggered: they apply only
//! when the status that preceded the current FREE state was a trial or a
//! paid subscription respectively. Since there is one previous status,
//! the two can never apply together. Usage-limit is level-triggered and
//! re-evaluated on every check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::billing::{CachedSnapshot, Entitlement, LimitStatus, SubscriptionStatus};
use crate::clock::Clock;
use crate::error::EngineError;
use crate::ports::DismissalStore;

/// Banner types, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BannerType {
    TrialCompleted,
    PremiumExpired,
    UsageLimit,
}

impl BannerType {
    /// Highest priority first
    pub const BY_PRIORITY: [BannerType; 3] =
        [Self::TrialCompleted, Self::PremiumExpired, Self::UsageLimit];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrialCompleted => "trial_completed",
            Self::PremiumExpired => "premium_expired",
            Self::UsageLimit => "usage_limit",
        }
    }
}

impl fmt::Display for BannerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BannerType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::BY_PRIORITY
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| EngineError::UnknownValue {
                field: "bannerType",
                value: s.to_string(),
            })
    }
}

/// Per-banner state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BannerState {
    Eligible,
    Dismissed,
    NotApplicable,
}

/// Outcome of one evaluation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BannerDecision {
    pub trial_completed: BannerState,
    pub premium_expired: BannerState,
    pub usage_limit: BannerState,
    /// The single banner the presentation layer should show
    pub surfaced: Option<BannerType>,
}

impl BannerDecision {
    pub fn state(&self, banner: BannerType) -> BannerState {
        match banner {
            BannerType::TrialCompleted => self.trial_completed,
            BannerType::PremiumExpired => self.premium_expired,
            BannerType::UsageLimit => self.usage_limit,
        }
    }

    pub fn should_show(&self, banner: BannerType) -> bool {
        self.surfaced == Some(banner)
    }
}

/// Whether a banner's conditions hold, ignoring dismissals
pub fn is_applicable(
    banner: BannerType,
    snapshot: Option<&CachedSnapshot>,
    limits: Option<&LimitStatus>,
) -> bool {
    match banner {
        BannerType::TrialCompleted => snapshot.is_some_and(|snap| {
            snap.state.has_ever_used_trial
                && snap.state.entitlement == Entitlement::Free
                && snap.previous_status == Some(SubscriptionStatus::Trial)
        }),
        BannerType::PremiumExpired => snapshot.is_some_and(|snap| {
            snap.state.has_ever_used_premium
                && snap.state.entitlement == Entitlement::Free
                && snap.previous_status.is_some_and(SubscriptionStatus::is_paid)
        }),
        BannerType::UsageLimit => limits.is_some_and(LimitStatus::any_limit_reached),
    }
}

/// Evaluates banners against the current snapshot and persisted dismissals
pub struct BannerEngine {
    dismissals: Arc<dyn DismissalStore>,
    clock: Arc<dyn Clock>,
}

impl BannerEngine {
    pub fn new(dismissals: Arc<dyn DismissalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { dismissals, clock }
    }

    /// Evaluate every banner type
    pub async fn evaluate(
        &self,
        snapshot: Option<&CachedSnapshot>,
        limits: Option<&LimitStatus>,
    ) -> BannerDecision {
        let mut states = [BannerState::NotApplicable; 3];
        for (slot, banner) in states.iter_mut().zip(BannerType::BY_PRIORITY) {
            if !is_applicable(banner, snapshot, limits) {
                continue;
            }
            *slot = if self.is_dismissed(banner).await {
                BannerState::Dismissed
            } else {
                BannerState::Eligible
            };
        }

        let surfaced = BannerType::BY_PRIORITY
            .into_iter()
            .zip(states)
            .find(|(_, state)| *state == BannerState::Eligible)
            .map(|(banner, _)| banner);

        BannerDecision {
            trial_completed: states[0],
            premium_expired: states[1],
            usage_limit: states[2],
            surfaced,
        }
    }

    /// True when `banner` is the one banner to show right now
    pub async fn should_show(
        &self,
        banner: BannerType,
        snapshot: Option<&CachedSnapshot>,
        limits: Option<&LimitStatus>,
    ) -> bool {
        self.evaluate(snapshot, limits).await.should_show(banner)
    }

    /// A dismissal read failure counts as dismissed so a broken store
    /// cannot make a banner reappear on every poll.
    async fn is_dismissed(&self, banner: BannerType) -> bool {
        match self.dismissals.read_dismissal(banner).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(banner = %banner, error = %e, "Failed to read banner dismissal");
                true
            }
        }
    }

    pub async fn dismissed_at(&self, banner: BannerType) -> Option<DateTime<Utc>> {
        self.dismissals.read_dismissal(banner).await.ok().flatten()
    }

    /// Persist a dismissal. Returns false if it could not be stored.
    pub async fn dismiss(&self, banner: BannerType) -> bool {
        match self.dismissals.persist_dismissal(banner, self.clock.now()).await {
            Ok(()) => {
                info!(banner = %banner, "Banner dismissed");
                true
            }
            Err(e) => {
                warn!(banner = %banner, error = %e, "Failed to persist banner dismissal");
                false
            }
        }
    }

    /// Clear a dismissal (diagnostics and tests)
    pub async fn reset(&self, banner: BannerType) -> bool {
        match self.dismissals.clear_dismissal(banner).await {
            Ok(()) => {
                info!(banner = %banner, "Banner dismissal reset");
                true
            }
            Err(e) => {
                warn!(banner = %banner, error = %e, "Failed to reset banner dismissal");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{EntitlementState, PlanLimitsTable, UsageQuotaTracker, UsageRecord};
    use crate::billing::Resource;
    use crate::clock::SystemClock;
    use crate::storage::MemoryStore;
    use chrono::Duration;

    fn engine() -> BannerEngine {
        BannerEngine::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    fn free_snapshot(
        trial: bool,
        premium: bool,
        previous: Option<SubscriptionStatus>,
    ) -> CachedSnapshot {
        CachedSnapshot {
            state: EntitlementState {
                subscription_status: SubscriptionStatus::Expired,
                has_ever_used_trial: trial,
                has_ever_used_premium: premium,
                ..Default::default()
            },
            previous_status: previous,
            cached_at: Utc::now(),
        }
    }

    fn limits(pages: u64) -> LimitStatus {
        let tracker = UsageQuotaTracker::new(
            PlanLimitsTable::default(),
            10,
            80,
            Duration::zero(),
            Arc::new(SystemClock),
        );
        let mut usage = UsageRecord::empty("u");
        usage.increment(Resource::PagesProcessed, pages, Utc::now());
        tracker.check_limits(&EntitlementState::free(), &usage, false)
    }

    #[tokio::test]
    async fn test_trial_and_premium_are_mutually_exclusive() {
        let engine = engine();

        let after_trial = free_snapshot(true, true, Some(SubscriptionStatus::Trial));
        let decision = engine.evaluate(Some(&after_trial), None).await;
        assert_eq!(decision.trial_completed, BannerState::Eligible);
        assert_eq!(decision.premium_expired, BannerState::NotApplicable);
        assert_eq!(decision.surfaced, Some(BannerType::TrialCompleted));

        let after_paid = free_snapshot(true, true, Some(SubscriptionStatus::Cancelled));
        let decision = engine.evaluate(Some(&after_paid), None).await;
        assert_eq!(decision.trial_completed, BannerState::NotApplicable);
        assert_eq!(decision.premium_expired, BannerState::Eligible);
        assert_eq!(decision.surfaced, Some(BannerType::PremiumExpired));
    }

    #[tokio::test]
    async fn test_no_banner_without_observed_transition() {
        let engine = engine();
        let long_expired = free_snapshot(true, false, None);

        let decision = engine.evaluate(Some(&long_expired), None).await;
        assert_eq!(decision.surfaced, None);
        assert_eq!(decision.trial_completed, BannerState::NotApplicable);
    }

    #[tokio::test]
    async fn test_usage_banner_has_lowest_priority() {
        let engine = engine();
        let after_trial = free_snapshot(true, false, Some(SubscriptionStatus::Trial));
        let exhausted = limits(10);

        let decision = engine.evaluate(Some(&after_trial), Some(&exhausted)).await;
        assert_eq!(decision.usage_limit, BannerState::Eligible);
        assert!(decision.should_show(BannerType::TrialCompleted));
        assert!(!decision.should_show(BannerType::UsageLimit));

        assert!(engine.dismiss(BannerType::TrialCompleted).await);
        assert!(
            engine
                .should_show(BannerType::UsageLimit, Some(&after_trial), Some(&exhausted))
                .await
        );
    }

    #[tokio::test]
    async fn test_usage_banner_is_level_triggered() {
        let engine = engine();
        assert!(engine.should_show(BannerType::UsageLimit, None, Some(&limits(10))).await);
        assert!(!engine.should_show(BannerType::UsageLimit, None, Some(&limits(3))).await);
    }

    #[tokio::test]
    async fn test_dismissal_persists_until_reset() {
        let engine = engine();
        let after_trial = free_snapshot(true, false, Some(SubscriptionStatus::Trial));

        assert!(engine.should_show(BannerType::TrialCompleted, Some(&after_trial), None).await);
        engine.dismiss(BannerType::TrialCompleted).await;
        assert!(engine.dismissed_at(BannerType::TrialCompleted).await.is_some());

        for _ in 0..3 {
            let decision = engine.evaluate(Some(&after_trial), None).await;
            assert_eq!(decision.trial_completed, BannerState::Dismissed);
            assert!(!decision.should_show(BannerType::TrialCompleted));
        }

        engine.reset(BannerType::TrialCompleted).await;
        assert!(engine.should_show(BannerType::TrialCompleted, Some(&after_trial), None).await);
    }

    #[tokio::test]
    async fn test_premium_user_sees_no_lifecycle_banner() {
        let engine = engine();
        let mut snapshot = free_snapshot(true, true, Some(SubscriptionStatus::Trial));
        snapshot.state.entitlement = Entitlement::Premium;
        snapshot.state.subscription_status = SubscriptionStatus::Active;

        let decision = engine.evaluate(Some(&snapshot), None).await;
        assert_eq!(decision.surfaced, None);
    }

    #[test]
    fn test_banner_type_parsing() {
        assert_eq!("usage_limit".parse::<BannerType>().unwrap(), BannerType::UsageLimit);
        assert!("promo".parse::<BannerType>().is_err());
    }
}
