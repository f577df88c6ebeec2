//! Scripted collaborator doubles shared by the unit tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::billing::RemoteEntitlement;
use crate::error::{EngineError, Result};
use crate::ports::{EntitlementDocumentStore, ReceiptValidator};

/// A remote source that returns whatever it was last told to.
/// Implements both remote ports so one type serves either side.
pub struct ScriptedSource {
    response: Mutex<Result<RemoteEntitlement>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn failing() -> Self {
        Self {
            response: Mutex::new(Err(unavailable())),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn responding(remote: RemoteEntitlement) -> Self {
        let source = Self::failing();
        source.respond(remote);
        source
    }

    pub fn respond(&self, remote: RemoteEntitlement) {
        *self.response.lock().unwrap() = Ok(remote);
    }

    pub fn fail(&self) {
        *self.response.lock().unwrap() = Err(unavailable());
    }

    /// Make every subsequent call sleep first
    pub fn delay(&self, by: Duration) {
        *self.delay.lock().unwrap() = Some(by);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer(&self) -> Result<RemoteEntitlement> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.response.lock().unwrap().clone()
    }
}

fn unavailable() -> EngineError {
    EngineError::Remote {
        source_name: "scripted",
        message: "unavailable".to_string(),
    }
}

#[async_trait]
impl ReceiptValidator for ScriptedSource {
    async fn fetch_receipt_status(&self, _user_id: &str) -> Result<RemoteEntitlement> {
        self.answer().await
    }
}

#[async_trait]
impl EntitlementDocumentStore for ScriptedSource {
    async fn fetch_stored_entitlement(&self, _user_id: &str) -> Result<RemoteEntitlement> {
        self.answer().await
    }
}
