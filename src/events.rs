//! Lifecycle event bus
//!
//! In-process multicast over a tokio broadcast channel. Publishing never
//! blocks and never fails the publisher. A subscriber only sees events sent
//! after it subscribed; the small history ring is for diagnostics and is
//! never replayed into subscriptions.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::billing::{EntitlementState, SubscriptionStatus};

/// Lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Purchased,
    TrialStarted,
    Expired,
    Cancelled,
    Refunded,
    Renewed,
    WebhookReceived,
    StateRefreshed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Purchased => "purchased",
            Self::TrialStarted => "trial_started",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Renewed => "renewed",
            Self::WebhookReceived => "webhook_received",
            Self::StateRefreshed => "state_refreshed",
        };
        f.write_str(name)
    }
}

/// A published event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Snapshot current when the event was produced
    pub state: EntitlementState,
    /// Producer label, e.g. "reconcile" or "webhook"
    pub context: String,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(
        kind: EventKind,
        state: EntitlementState,
        context: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state,
            context: context.into(),
            metadata: HashMap::new(),
            timestamp,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Broadcast bus for engine events
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    history: Mutex<VecDeque<EngineEvent>>,
    history_capacity: usize,
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// losing events. Must be non-zero.
    pub fn new(capacity: usize, history_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
        }
    }

    /// Fire-and-forget publish. Returns how many subscribers received it.
    pub fn publish(&self, event: EngineEvent) -> usize {
        match event.kind {
            EventKind::StateRefreshed | EventKind::WebhookReceived => {
                debug!(kind = %event.kind, context = event.context, "Publishing event")
            }
            _ => info!(
                kind = %event.kind,
                context = event.context,
                status = %event.state.subscription_status,
                "Publishing lifecycle event"
            ),
        }

        if self.history_capacity > 0 {
            let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to every event, or only to one kind
    pub fn subscribe(&self, filter: Option<EventKind>) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Most recent events, oldest first
    pub fn recent(&self) -> Vec<EngineEvent> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.iter().cloned().collect()
    }
}

/// Receiving end of a subscription
pub struct EventSubscription {
    receiver: broadcast::Receiver<EngineEvent>,
    filter: Option<EventKind>,
}

impl EventSubscription {
    fn accepts(&self, event: &EngineEvent) -> bool {
        self.filter.map_or(true, |kind| kind == event.kind)
    }

    /// Next matching event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already delivered, without waiting
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Adapt into a `Stream` for hosts that consume streams
    pub fn into_stream(self) -> impl Stream<Item = EngineEvent> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

/// Lifecycle kinds implied by moving from `old` to `new`.
///
/// Nothing is derived without a previous snapshot; a cold start only
/// refreshes.
pub fn lifecycle_transitions(old: Option<&EntitlementState>, new: &EntitlementState) -> Vec<EventKind> {
    let Some(old) = old else {
        return Vec::new();
    };
    let before = old.subscription_status;
    let after = new.subscription_status;
    let mut kinds = Vec::new();

    match after {
        SubscriptionStatus::Trial if before != SubscriptionStatus::Trial => {
            kinds.push(EventKind::TrialStarted)
        }
        SubscriptionStatus::Active if !before.is_paid() => kinds.push(EventKind::Purchased),
        SubscriptionStatus::Active => {
            let extended = match (old.expiration_date, new.expiration_date) {
                (Some(prev), Some(next)) => next > prev,
                _ => false,
            };
            if extended || before == SubscriptionStatus::GracePeriod {
                kinds.push(EventKind::Renewed);
            }
        }
        SubscriptionStatus::Cancelled if before.grants_premium() && before != after => {
            kinds.push(EventKind::Cancelled)
        }
        SubscriptionStatus::Expired if before.grants_premium() => kinds.push(EventKind::Expired),
        _ => {}
    }

    kinds
}
