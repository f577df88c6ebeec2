//! Subscription entitlement and usage-quota engine.
//!
//! Reconciles a user's entitlement from a receipt service and a document
//! store, enforces per-tier usage limits, decides which upgrade banner to
//! show and broadcasts lifecycle events. Hosts build one
//! [`EntitlementEngine`] per signed-in user and supply the collaborator
//! ports from [`ports`].

pub mod banners;
pub mod billing;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod ports;
pub mod storage;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use banners::{BannerDecision, BannerState, BannerType};
pub use billing::{
    Entitlement, EntitlementState, LimitStatus, PlanLimits, Resource, ResourceStatus,
    SubscriptionStatus, SubscriptionType,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{Collaborators, EntitlementEngine, WebhookNotification};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventKind, EventSubscription};
pub use supervisor::Progress;
