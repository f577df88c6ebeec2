//! Entitlement data types
//!
//! `EntitlementState` is the canonical snapshot of a user's subscription.
//! Raw collaborator payloads are parsed into typed records exactly once, at
//! `RawEntitlementRecord`; nothing past that point handles strings.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Product tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entitlement {
    #[default]
    Free,
    Premium,
}

impl fmt::Display for Entitlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl FromStr for Entitlement {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "premium" | "pro" => Ok(Self::Premium),
            other => Err(EngineError::UnknownValue {
                field: "entitlement",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle phase of a premium grant, independent of tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    None,
    Trial,
    Active,
    Cancelled,
    Expired,
    GracePeriod,
}

impl SubscriptionStatus {
    /// Statuses that carry premium access while their deadline holds.
    ///
    /// CANCELLED stays entitled until the expiration date whatever the
    /// auto-renew flag says.
    pub fn grants_premium(self) -> bool {
        matches!(
            self,
            Self::Trial | Self::Active | Self::Cancelled | Self::GracePeriod
        )
    }

    /// Statuses of a paid (non-trial) subscription
    pub fn is_paid(self) -> bool {
        matches!(self, Self::Active | Self::Cancelled | Self::GracePeriod)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::GracePeriod => "grace_period",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Store and backend spellings both appear in payloads
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "trial" | "trialing" | "free_trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            "grace_period" | "grace" | "in_grace_period" => Ok(Self::GracePeriod),
            other => Err(EngineError::UnknownValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Billing cadence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    #[default]
    None,
    Monthly,
    Yearly,
}

impl FromStr for SubscriptionType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "monthly" | "month" => Ok(Self::Monthly),
            "yearly" | "annual" | "year" => Ok(Self::Yearly),
            other => Err(EngineError::UnknownValue {
                field: "subscriptionType",
                value: other.to_string(),
            }),
        }
    }
}

/// Typed entitlement record returned by a remote source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntitlement {
    pub entitlement: Entitlement,
    pub status: SubscriptionStatus,
    pub expiration_date: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub subscription_type: SubscriptionType,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    /// Historical flags; only the document store is expected to carry them
    #[serde(default)]
    pub has_ever_used_trial: bool,
    #[serde(default)]
    pub has_ever_used_premium: bool,
}

/// Timestamp as it appears in collaborator payloads
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Unix time in milliseconds
    Millis(i64),
    /// RFC 3339 text
    Text(String),
}

impl RawTimestamp {
    fn parse(&self, field: &'static str) -> Result<DateTime<Utc>, EngineError> {
        match self {
            Self::Millis(ms) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .ok_or_else(|| EngineError::UnknownValue {
                    field,
                    value: ms.to_string(),
                }),
            Self::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| EngineError::UnknownValue {
                    field,
                    value: text.clone(),
                }),
        }
    }
}

/// Untyped payload as delivered by the receipt service or document store
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEntitlementRecord {
    pub entitlement: Option<String>,
    pub status: Option<String>,
    pub expiration_date: Option<RawTimestamp>,
    pub start_date: Option<RawTimestamp>,
    pub auto_renew: Option<bool>,
    pub subscription_type: Option<String>,
    pub has_ever_used_trial: Option<bool>,
    pub has_ever_used_premium: Option<bool>,
}

impl RawEntitlementRecord {
    /// Parse a JSON payload and convert it in one step
    pub fn parse_json(json: &str) -> Result<RemoteEntitlement, EngineError> {
        let raw: Self = serde_json::from_str(json)?;
        RemoteEntitlement::try_from(raw)
    }
}

impl TryFrom<RawEntitlementRecord> for RemoteEntitlement {
    type Error = EngineError;

    fn try_from(raw: RawEntitlementRecord) -> Result<Self, Self::Error> {
        let entitlement = match raw.entitlement.as_deref() {
            Some(s) => s.parse()?,
            None => Entitlement::Free,
        };
        let status = match raw.status.as_deref() {
            Some(s) => s.parse()?,
            None => SubscriptionStatus::None,
        };
        let subscription_type = match raw.subscription_type.as_deref() {
            Some(s) => s.parse()?,
            None => SubscriptionType::None,
        };

        Ok(Self {
            entitlement,
            status,
            expiration_date: raw
                .expiration_date
                .as_ref()
                .map(|t| t.parse("expirationDate"))
                .transpose()?,
            auto_renew: raw.auto_renew.unwrap_or(false),
            subscription_type,
            start_date: raw
                .start_date
                .as_ref()
                .map(|t| t.parse("startDate"))
                .transpose()?,
            has_ever_used_trial: raw.has_ever_used_trial.unwrap_or(false),
            has_ever_used_premium: raw.has_ever_used_premium.unwrap_or(false),
        })
    }
}

/// A correction applied while normalizing a reconciled record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Record claimed a live status after its access deadline
    ExpiredByDate {
        reported: SubscriptionStatus,
        deadline: DateTime<Utc>,
    },
    /// Record claimed EXPIRED while its deadline is still ahead
    ExpiredWithFutureDate { deadline: DateTime<Utc> },
    /// Tier disagreed with the status-derived tier
    EntitlementMismatch {
        reported: Entitlement,
        derived: Entitlement,
    },
    /// Trial flag disagreed with the status
    TrialFlagMismatch,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpiredByDate { reported, deadline } => {
                write!(f, "status {} past its deadline {}", reported, deadline)
            }
            Self::ExpiredWithFutureDate { deadline } => {
                write!(f, "status expired with deadline {} still ahead", deadline)
            }
            Self::EntitlementMismatch { reported, derived } => {
                write!(f, "entitlement {} but status implies {}", reported, derived)
            }
            Self::TrialFlagMismatch => write!(f, "trial flag disagrees with status"),
        }
    }
}

/// Canonical snapshot of a user's subscription.
///
/// Never mutated once published; every change produces a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementState {
    pub entitlement: Entitlement,
    pub subscription_status: SubscriptionStatus,
    /// True only while `subscription_status == Trial`
    pub is_free_trial_active: bool,
    pub auto_renew_enabled: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    /// Monotonic: once true, never false again
    pub has_ever_used_trial: bool,
    /// Monotonic: once true, never false again
    pub has_ever_used_premium: bool,
    pub subscription_type: SubscriptionType,
}

impl EntitlementState {
    /// FREE/NONE state used when nothing better is known
    pub fn free() -> Self {
        Self::default()
    }

    /// Build a state from a remote record. Flags implied by the reported
    /// status are folded in before any normalization.
    pub fn from_remote(remote: &RemoteEntitlement) -> Self {
        Self {
            entitlement: remote.entitlement,
            subscription_status: remote.status,
            is_free_trial_active: remote.status == SubscriptionStatus::Trial,
            auto_renew_enabled: remote.auto_renew,
            start_date: remote.start_date,
            expiration_date: remote.expiration_date,
            has_ever_used_trial: remote.has_ever_used_trial
                || remote.status == SubscriptionStatus::Trial,
            has_ever_used_premium: remote.has_ever_used_premium || remote.status.is_paid(),
            subscription_type: remote.subscription_type,
        }
    }

    /// Point after which access ends. GRACE_PERIOD extends the expiration
    /// date by the grace window.
    pub fn access_deadline(&self, grace: Duration) -> Option<DateTime<Utc>> {
        self.expiration_date.map(|exp| {
            if self.subscription_status == SubscriptionStatus::GracePeriod {
                exp.checked_add_signed(grace).unwrap_or(DateTime::<Utc>::MAX_UTC)
            } else {
                exp
            }
        })
    }

    /// Re-derive status and tier from dates.
    ///
    /// Returns the corrected state and the list of corrections applied.
    pub fn normalize(
        mut self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> (Self, Vec<InvariantViolation>) {
        let mut violations = Vec::new();

        if let Some(deadline) = self.access_deadline(grace) {
            let status = self.subscription_status;
            if deadline <= now && status != SubscriptionStatus::Expired {
                if status != SubscriptionStatus::None {
                    violations.push(InvariantViolation::ExpiredByDate {
                        reported: status,
                        deadline,
                    });
                }
                self.subscription_status = SubscriptionStatus::Expired;
            } else if deadline > now && status == SubscriptionStatus::Expired {
                violations.push(InvariantViolation::ExpiredWithFutureDate { deadline });
                self.subscription_status = if self.auto_renew_enabled {
                    SubscriptionStatus::Active
                } else {
                    SubscriptionStatus::Cancelled
                };
            }
        }

        let derived = if self.subscription_status.grants_premium() {
            Entitlement::Premium
        } else {
            Entitlement::Free
        };
        if derived != self.entitlement {
            // Expiry-driven downgrades are already reported above
            if !matches!(violations.last(), Some(InvariantViolation::ExpiredByDate { .. })) {
                violations.push(InvariantViolation::EntitlementMismatch {
                    reported: self.entitlement,
                    derived,
                });
            }
            self.entitlement = derived;
        }

        let trial_active = self.subscription_status == SubscriptionStatus::Trial;
        if self.is_free_trial_active != trial_active {
            if trial_active || self.subscription_status != SubscriptionStatus::Expired {
                violations.push(InvariantViolation::TrialFlagMismatch);
            }
            self.is_free_trial_active = trial_active;
        }

        if self.subscription_status == SubscriptionStatus::Expired {
            self.auto_renew_enabled = false;
        }

        (self, violations)
    }

    /// OR the historical flags into this state
    pub fn with_history(mut self, has_ever_used_trial: bool, has_ever_used_premium: bool) -> Self {
        self.has_ever_used_trial |= has_ever_used_trial;
        self.has_ever_used_premium |= has_ever_used_premium;
        self
    }

    /// Tier the user is entitled to right now, derived from the whole state
    /// rather than the stored tier alone.
    pub fn effective_entitlement(&self, now: DateTime<Utc>, grace: Duration) -> Entitlement {
        if self.entitlement != Entitlement::Premium
            || !self.subscription_status.grants_premium()
        {
            return Entitlement::Free;
        }
        match self.access_deadline(grace) {
            Some(deadline) if deadline <= now => Entitlement::Free,
            _ => Entitlement::Premium,
        }
    }

    pub fn is_premium(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.effective_entitlement(now, grace) == Entitlement::Premium
    }

    /// A trial can be offered only to users who never had one nor paid
    pub fn is_trial_offer_eligible(&self) -> bool {
        !self.has_ever_used_trial && !self.has_ever_used_premium
    }

    /// Whole days until expiration, or `None` when there is no expiration.
    /// Never negative.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiration_date
            .map(|exp| (exp - now).num_days().max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn premium(status: SubscriptionStatus, expires_in: Duration, now: DateTime<Utc>) -> EntitlementState {
        EntitlementState {
            entitlement: Entitlement::Premium,
            subscription_status: status,
            is_free_trial_active: status == SubscriptionStatus::Trial,
            auto_renew_enabled: true,
            start_date: Some(now - Duration::days(30)),
            expiration_date: Some(now + expires_in),
            has_ever_used_trial: false,
            has_ever_used_premium: true,
            subscription_type: SubscriptionType::Monthly,
        }
    }

    #[test]
    fn test_status_parsing_accepts_aliases() {
        assert_eq!("trialing".parse::<SubscriptionStatus>().unwrap(), SubscriptionStatus::Trial);
        assert_eq!("canceled".parse::<SubscriptionStatus>().unwrap(), SubscriptionStatus::Cancelled);
        assert_eq!(
            "GRACE_PERIOD".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::GracePeriod
        );
        assert!("paused".parse::<SubscriptionStatus>().is_err());
        assert!("gold".parse::<Entitlement>().is_err());
    }

    #[test]
    fn test_grace_deadline_near_max_date_saturates() {
        let now = Utc::now();
        let far = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        let json = format!(
            r#"{{"entitlement":"premium","status":"grace_period","expirationDate":{}}}"#,
            far.timestamp_millis()
        );
        let remote = RawEntitlementRecord::parse_json(&json).unwrap();
        let state = EntitlementState::from_remote(&remote);

        assert_eq!(state.access_deadline(Duration::days(3)), Some(DateTime::<Utc>::MAX_UTC));
        let (normalized, _) = state.normalize(now, Duration::days(3));
        assert_eq!(normalized.subscription_status, SubscriptionStatus::GracePeriod);
        assert!(normalized.is_premium(now, Duration::days(3)));
    }

    #[test]
    fn test_raw_record_conversion() {
        let remote = RawEntitlementRecord::parse_json(
            r#"{
                "entitlement": "premium",
                "status": "active",
                "expirationDate": "2030-01-01T00:00:00Z",
                "autoRenew": true,
                "subscriptionType": "yearly",
                "hasEverUsedTrial": true
            }"#,
        )
        .unwrap();
        assert_eq!(remote.entitlement, Entitlement::Premium);
        assert_eq!(remote.status, SubscriptionStatus::Active);
        assert_eq!(remote.subscription_type, SubscriptionType::Yearly);
        assert!(remote.has_ever_used_trial);
        assert!(!remote.has_ever_used_premium);
        assert_eq!(
            remote.expiration_date,
            Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_raw_record_millis_and_defaults() {
        let remote = RawEntitlementRecord::parse_json(r#"{"expirationDate": 1735689600000}"#).unwrap();
        assert_eq!(remote.entitlement, Entitlement::Free);
        assert_eq!(remote.status, SubscriptionStatus::None);
        assert_eq!(remote.expiration_date.unwrap().timestamp_millis(), 1735689600000);
    }

    #[test]
    fn test_raw_record_rejects_unknown_status() {
        let err = RawEntitlementRecord::parse_json(r#"{"status": "paused"}"#).unwrap_err();
        assert!(matches!(err, EngineError::UnknownValue { field: "status", .. }));
    }

    #[test]
    fn test_expired_active_is_normalized() {
        let now = Utc::now();
        let state = premium(SubscriptionStatus::Active, Duration::days(-1), now);

        let (normalized, violations) = state.normalize(now, Duration::days(3));
        assert_eq!(normalized.subscription_status, SubscriptionStatus::Expired);
        assert_eq!(normalized.entitlement, Entitlement::Free);
        assert!(!normalized.auto_renew_enabled);
        assert!(matches!(violations[0], InvariantViolation::ExpiredByDate { .. }));
    }

    #[test]
    fn test_expired_with_future_date_is_rederived() {
        let now = Utc::now();
        let mut state = premium(SubscriptionStatus::Expired, Duration::days(10), now);
        state.auto_renew_enabled = false;

        let (normalized, violations) = state.normalize(now, Duration::days(3));
        assert_eq!(normalized.subscription_status, SubscriptionStatus::Cancelled);
        assert_eq!(normalized.entitlement, Entitlement::Premium);
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_cancelled_stays_premium_until_expiration() {
        let now = Utc::now();
        let mut state = premium(SubscriptionStatus::Cancelled, Duration::days(2), now);
        state.auto_renew_enabled = false;

        let (normalized, violations) = state.clone().normalize(now, Duration::days(3));
        assert!(violations.is_empty());
        assert_eq!(normalized.entitlement, Entitlement::Premium);
        assert!(state.is_premium(now, Duration::days(3)));
        assert!(!state.is_premium(now + Duration::days(2), Duration::days(3)));
    }

    #[test]
    fn test_grace_period_extends_access() {
        let now = Utc::now();
        let state = premium(SubscriptionStatus::GracePeriod, Duration::days(-1), now);

        let (normalized, _) = state.clone().normalize(now, Duration::days(3));
        assert_eq!(normalized.subscription_status, SubscriptionStatus::GracePeriod);
        assert_eq!(normalized.entitlement, Entitlement::Premium);

        let (after_grace, _) = state.normalize(now + Duration::days(3), Duration::days(3));
        assert_eq!(after_grace.subscription_status, SubscriptionStatus::Expired);
        assert_eq!(after_grace.entitlement, Entitlement::Free);
    }

    #[test]
    fn test_trial_flag_follows_status() {
        let now = Utc::now();
        let remote = RemoteEntitlement {
            entitlement: Entitlement::Premium,
            status: SubscriptionStatus::Trial,
            expiration_date: Some(now + Duration::days(7)),
            ..Default::default()
        };
        let state = EntitlementState::from_remote(&remote);
        assert!(state.is_free_trial_active);
        assert!(state.has_ever_used_trial);
        assert!(!state.has_ever_used_premium);

        let (expired, _) = state.normalize(now + Duration::days(8), Duration::zero());
        assert!(!expired.is_free_trial_active);
        assert!(expired.has_ever_used_trial);
    }

    #[test]
    fn test_effective_entitlement_ignores_stale_tier() {
        let now = Utc::now();
        let stale = EntitlementState {
            entitlement: Entitlement::Premium,
            subscription_status: SubscriptionStatus::Expired,
            ..Default::default()
        };
        assert_eq!(stale.effective_entitlement(now, Duration::zero()), Entitlement::Free);
    }

    #[test]
    fn test_history_is_or_merged() {
        let state = EntitlementState::free()
            .with_history(true, false)
            .with_history(false, true)
            .with_history(false, false);
        assert!(state.has_ever_used_trial);
        assert!(state.has_ever_used_premium);
        assert!(!state.is_trial_offer_eligible());
        assert!(EntitlementState::free().is_trial_offer_eligible());
    }

    #[test]
    fn test_days_remaining() {
        let now = Utc::now();
        let state = premium(SubscriptionStatus::Active, Duration::days(5) + Duration::hours(1), now);
        assert_eq!(state.days_remaining(now), Some(5));
        assert_eq!(state.days_remaining(now + Duration::days(9)), Some(0));
        assert_eq!(EntitlementState::free().days_remaining(now), None);
    }
}
