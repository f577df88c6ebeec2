//! Usage counters
//!
//! Counters are incremented by the OCR, speech and translation
//! collaborators. The engine only reads them, apart from the periodic reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Metered resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    PagesProcessed,
    SpeechRequests,
    TranslatedCharacters,
    StorageBytes,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Self::PagesProcessed,
        Self::SpeechRequests,
        Self::TranslatedCharacters,
        Self::StorageBytes,
    ];

    /// Column / key name used by the local stores
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PagesProcessed => "pages_processed",
            Self::SpeechRequests => "speech_requests",
            Self::TranslatedCharacters => "translated_characters",
            Self::StorageBytes => "storage_bytes",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| EngineError::UnknownValue {
                field: "resource",
                value: s.to_string(),
            })
    }
}

/// A counter value and when it last changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounter {
    pub value: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl UsageCounter {
    pub fn new(value: u64, last_updated: DateTime<Utc>) -> Self {
        Self {
            value,
            last_updated: Some(last_updated),
        }
    }
}

/// Per-user consumption counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub user_id: String,
    pub pages_processed: UsageCounter,
    pub speech_requests: UsageCounter,
    pub translated_characters: UsageCounter,
    pub storage_bytes: UsageCounter,
}

impl UsageRecord {
    /// Empty record for a user
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    pub fn counter(&self, resource: Resource) -> &UsageCounter {
        match resource {
            Resource::PagesProcessed => &self.pages_processed,
            Resource::SpeechRequests => &self.speech_requests,
            Resource::TranslatedCharacters => &self.translated_characters,
            Resource::StorageBytes => &self.storage_bytes,
        }
    }

    fn counter_mut(&mut self, resource: Resource) -> &mut UsageCounter {
        match resource {
            Resource::PagesProcessed => &mut self.pages_processed,
            Resource::SpeechRequests => &mut self.speech_requests,
            Resource::TranslatedCharacters => &mut self.translated_characters,
            Resource::StorageBytes => &mut self.storage_bytes,
        }
    }

    pub fn get(&self, resource: Resource) -> u64 {
        self.counter(resource).value
    }

    /// Monotonic increment; saturates instead of wrapping
    pub fn increment(&mut self, resource: Resource, amount: u64, at: DateTime<Utc>) {
        let counter = self.counter_mut(resource);
        counter.value = counter.value.saturating_add(amount);
        counter.last_updated = Some(at);
    }
}
