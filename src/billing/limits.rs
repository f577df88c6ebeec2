//! Usage quota enforcement
//!
//! Maps an entitlement snapshot to per-resource limits and reports how far
//! each counter is from its limit.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::types::{Entitlement, EntitlementState};
use super::usage::{Resource, UsageRecord};
use crate::clock::Clock;

const MB: u64 = 1024 * 1024;

/// Limits for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub max_pages: u64,
    pub max_speech_requests: u64,
    pub max_characters: u64,
    pub max_storage_bytes: u64,
}

impl PlanLimits {
    pub fn free() -> Self {
        Self {
            max_pages: 10,
            max_speech_requests: 50,
            max_characters: 10_000,
            max_storage_bytes: 100 * MB,
        }
    }

    pub fn premium() -> Self {
        Self {
            max_pages: 500,
            max_speech_requests: 3_000,
            max_characters: 500_000,
            max_storage_bytes: 5 * 1024 * MB,
        }
    }

    /// Get limit for a specific resource
    pub fn limit(&self, resource: Resource) -> u64 {
        match resource {
            Resource::PagesProcessed => self.max_pages,
            Resource::SpeechRequests => self.max_speech_requests,
            Resource::TranslatedCharacters => self.max_characters,
            Resource::StorageBytes => self.max_storage_bytes,
        }
    }
}

/// Static lookup table keyed by tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanLimitsTable {
    pub free: PlanLimits,
    pub premium: PlanLimits,
}

impl Default for PlanLimitsTable {
    fn default() -> Self {
        Self {
            free: PlanLimits::free(),
            premium: PlanLimits::premium(),
        }
    }
}

impl PlanLimitsTable {
    pub fn for_entitlement(&self, entitlement: Entitlement) -> &PlanLimits {
        match entitlement {
            Entitlement::Free => &self.free,
            Entitlement::Premium => &self.premium,
        }
    }
}

/// Consumption of one resource against its limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub resource: Resource,
    pub current: u64,
    pub limit: u64,
    /// 0..=100
    pub percentage: f64,
    pub limit_reached: bool,
    /// At or past the warning threshold
    pub near_limit: bool,
}

impl ResourceStatus {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }
}

/// Result of a quota check across every resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStatus {
    /// Tier the limits were taken from
    pub entitlement: Entitlement,
    pub with_buffer: bool,
    pub pages_processed: ResourceStatus,
    pub speech_requests: ResourceStatus,
    pub translated_characters: ResourceStatus,
    pub storage_bytes: ResourceStatus,
}

impl LimitStatus {
    pub fn get(&self, resource: Resource) -> &ResourceStatus {
        match resource {
            Resource::PagesProcessed => &self.pages_processed,
            Resource::SpeechRequests => &self.speech_requests,
            Resource::TranslatedCharacters => &self.translated_characters,
            Resource::StorageBytes => &self.storage_bytes,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceStatus> {
        Resource::ALL.into_iter().map(move |r| self.get(r))
    }

    /// True when any tracked resource is exhausted
    pub fn any_limit_reached(&self) -> bool {
        self.iter().any(|s| s.limit_reached)
    }

    pub fn exhausted(&self) -> Vec<Resource> {
        self.iter()
            .filter(|s| s.limit_reached)
            .map(|s| s.resource)
            .collect()
    }
}

/// Quota tracker.
///
/// Always re-derives the effective tier from the full snapshot, so a
/// PREMIUM record whose status is EXPIRED resolves to the FREE limits.
pub struct UsageQuotaTracker {
    limits: PlanLimitsTable,
    buffer_percent: u32,
    warning_percent: u8,
    grace: Duration,
    clock: Arc<dyn Clock>,
}

impl UsageQuotaTracker {
    pub fn new(
        limits: PlanLimitsTable,
        buffer_percent: u32,
        warning_percent: u8,
        grace: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limits,
            buffer_percent,
            warning_percent,
            grace,
            clock,
        }
    }

    /// Limits that apply to a snapshot right now
    pub fn limits_for(&self, state: &EntitlementState) -> PlanLimits {
        let entitlement = state.effective_entitlement(self.clock.now(), self.grace);
        *self.limits.for_entitlement(entitlement)
    }

    /// Check every resource against the effective limits.
    ///
    /// With `with_buffer`, a resource only counts as reached once it is
    /// `buffer_percent` past its limit, so work that is still being
    /// recorded does not get cut off at the boundary.
    pub fn check_limits(
        &self,
        state: &EntitlementState,
        usage: &UsageRecord,
        with_buffer: bool,
    ) -> LimitStatus {
        let entitlement = state.effective_entitlement(self.clock.now(), self.grace);
        let limits = self.limits.for_entitlement(entitlement);
        let status_for = |resource| self.evaluate(resource, usage, limits, with_buffer);

        let status = LimitStatus {
            entitlement,
            with_buffer,
            pages_processed: status_for(Resource::PagesProcessed),
            speech_requests: status_for(Resource::SpeechRequests),
            translated_characters: status_for(Resource::TranslatedCharacters),
            storage_bytes: status_for(Resource::StorageBytes),
        };

        debug!(
            user_id = usage.user_id,
            entitlement = %entitlement,
            with_buffer,
            exhausted = ?status.exhausted(),
            "Checked usage limits"
        );
        status
    }

    /// Quick check for a single resource
    pub fn is_exhausted(
        &self,
        state: &EntitlementState,
        usage: &UsageRecord,
        resource: Resource,
        with_buffer: bool,
    ) -> bool {
        let limits = self.limits_for(state);
        self.evaluate(resource, usage, &limits, with_buffer)
            .limit_reached
    }

    fn evaluate(
        &self,
        resource: Resource,
        usage: &UsageRecord,
        limits: &PlanLimits,
        with_buffer: bool,
    ) -> ResourceStatus {
        let current = usage.get(resource);
        let limit = limits.limit(resource);

        // A zero limit means the resource is unavailable on this tier
        if limit == 0 {
            return ResourceStatus {
                resource,
                current,
                limit,
                percentage: 100.0,
                limit_reached: true,
                near_limit: true,
            };
        }

        let percentage = (current as f64 / limit as f64 * 100.0).clamp(0.0, 100.0);
        // Integer comparison keeps `limit * 1.1` exact
        let limit_reached = if with_buffer {
            current as u128 * 100 >= limit as u128 * (100 + self.buffer_percent as u128)
        } else {
            current >= limit
        };

        ResourceStatus {
            resource,
            current,
            limit,
            percentage,
            limit_reached,
            near_limit: percentage >= self.warning_percent as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::types::SubscriptionStatus;
    use crate::clock::SystemClock;
    use chrono::Utc;

    fn tracker(limits: PlanLimitsTable) -> UsageQuotaTracker {
        UsageQuotaTracker::new(limits, 10, 80, Duration::days(3), Arc::new(SystemClock))
    }

    fn usage(pages: u64) -> UsageRecord {
        let mut usage = UsageRecord::empty("test_user");
        usage.increment(Resource::PagesProcessed, pages, Utc::now());
        usage
    }

    fn premium_state(status: SubscriptionStatus) -> EntitlementState {
        EntitlementState {
            entitlement: Entitlement::Premium,
            subscription_status: status,
            expiration_date: Some(Utc::now() + Duration::days(10)),
            ..Default::default()
        }
    }

    #[test]
    fn test_limit_reached_at_exact_limit() {
        let tracker = tracker(PlanLimitsTable::default());
        let status = tracker.check_limits(&EntitlementState::free(), &usage(10), false);
        assert!(status.pages_processed.limit_reached);
        assert_eq!(status.pages_processed.percentage, 100.0);
        assert_eq!(status.exhausted(), vec![Resource::PagesProcessed]);
    }

    #[test]
    fn test_buffer_tolerates_ten_percent() {
        let mut limits = PlanLimitsTable::default();
        limits.free.max_pages = 100;
        let tracker = tracker(limits);
        let free = EntitlementState::free();

        assert!(!tracker.check_limits(&free, &usage(100), true).pages_processed.limit_reached);
        assert!(!tracker.check_limits(&free, &usage(109), true).pages_processed.limit_reached);
        assert!(tracker.check_limits(&free, &usage(110), true).pages_processed.limit_reached);
        assert!(tracker.check_limits(&free, &usage(100), false).pages_processed.limit_reached);
    }

    #[test]
    fn test_zero_limit_is_exhausted() {
        let mut limits = PlanLimitsTable::default();
        limits.free.max_speech_requests = 0;
        let tracker = tracker(limits);

        let status = tracker.check_limits(&EntitlementState::free(), &usage(0), true);
        assert!(status.speech_requests.limit_reached);
        assert_eq!(status.speech_requests.percentage, 100.0);
        assert!(status.any_limit_reached());
    }

    #[test]
    fn test_percentage_is_clamped() {
        let tracker = tracker(PlanLimitsTable::default());
        let status = tracker.check_limits(&EntitlementState::free(), &usage(25), false);
        assert_eq!(status.pages_processed.percentage, 100.0);
        assert_eq!(status.pages_processed.remaining(), 0);

        let status = tracker.check_limits(&EntitlementState::free(), &usage(4), false);
        assert_eq!(status.pages_processed.percentage, 40.0);
        assert!(!status.pages_processed.near_limit);
    }

    #[test]
    fn test_expired_premium_uses_free_limits() {
        let tracker = tracker(PlanLimitsTable::default());
        let expired = premium_state(SubscriptionStatus::Expired);

        let status = tracker.check_limits(&expired, &usage(10), false);
        assert_eq!(status.entitlement, Entitlement::Free);
        assert_eq!(status.pages_processed.limit, PlanLimits::free().max_pages);
        assert!(status.pages_processed.limit_reached);
    }

    #[test]
    fn test_active_premium_uses_premium_limits() {
        let tracker = tracker(PlanLimitsTable::default());
        let active = premium_state(SubscriptionStatus::Active);

        let status = tracker.check_limits(&active, &usage(10), false);
        assert_eq!(status.entitlement, Entitlement::Premium);
        assert!(!status.any_limit_reached());
        assert!(!tracker.is_exhausted(&active, &usage(10), Resource::PagesProcessed, false));
    }

    #[test]
    fn test_near_limit_warning() {
        let tracker = tracker(PlanLimitsTable::default());
        let status = tracker.check_limits(&EntitlementState::free(), &usage(8), false);
        assert!(status.pages_processed.near_limit);
        assert!(!status.pages_processed.limit_reached);
    }
}
