//! Timeout supervisor for long-running remote operations
//!
//! Runs an operation with a once-per-second elapsed counter, a progress
//! callback on every tick and a hard timeout. On timeout the supervisor
//! stops waiting; the operation keeps running as a detached task and its
//! late result is discarded.
//!
//! Each logical operation has a named slot. Starting an operation while its
//! slot is busy is a logged no-op.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Default tick interval
const TICK: Duration = Duration::from_secs(1);

/// Reported on every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Whole ticks elapsed since start
    pub elapsed_secs: u64,
    /// Number of escalation thresholds already passed
    pub level: usize,
}

/// How a supervised operation ended
#[derive(Debug, PartialEq, Eq)]
pub enum SupervisedOutcome<T> {
    Completed(T),
    /// Hard timeout hit; the caller falls back to cached state
    TimedOut { after: Duration },
    /// The slot was busy and nothing was started
    AlreadyRunning,
    /// The operation task panicked or was aborted
    Failed(String),
}

impl<T> SupervisedOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Releases the slot when the supervised call ends, even if the caller's
/// future is dropped mid-flight.
struct SlotGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    slot: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.slot);
    }
}

pub struct OperationSupervisor {
    active: Mutex<HashSet<String>>,
    tick: Duration,
    /// Elapsed seconds at which `Progress::level` increases
    thresholds_secs: Vec<u64>,
}

impl OperationSupervisor {
    pub fn new(thresholds_secs: Vec<u64>) -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
            tick: TICK,
            thresholds_secs,
        }
    }

    pub fn is_active(&self, slot: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.contains(slot)
    }

    fn claim(&self, slot: &str) -> Option<SlotGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(slot.to_string()) {
            return None;
        }
        Some(SlotGuard {
            active: &self.active,
            slot: slot.to_string(),
        })
    }

    fn level_at(&self, elapsed_secs: u64) -> usize {
        self.thresholds_secs
            .iter()
            .filter(|&&t| elapsed_secs >= t)
            .count()
    }

    /// Run `operation` in `slot` under `timeout`.
    ///
    /// `on_progress` fires once per tick while the operation is pending;
    /// `on_timeout` fires once if the hard timeout is reached.
    pub async fn run<F, T, P, C>(
        &self,
        slot: &str,
        timeout: Duration,
        operation: F,
        mut on_progress: P,
        on_timeout: C,
    ) -> SupervisedOutcome<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        P: FnMut(Progress),
        C: FnOnce(Duration),
    {
        let Some(_guard) = self.claim(slot) else {
            warn!(slot = slot, "Supervised operation already running, ignoring start");
            return SupervisedOutcome::AlreadyRunning;
        };

        let start = Instant::now();
        let mut task = tokio::spawn(operation);
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = interval_at(start + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut elapsed_secs = 0u64;

        loop {
            tokio::select! {
                biased;
                joined = &mut task => {
                    debug!(slot = slot, elapsed_ms = start.elapsed().as_millis() as u64, "Supervised operation finished");
                    return match joined {
                        Ok(value) => SupervisedOutcome::Completed(value),
                        Err(e) => {
                            warn!(slot = slot, error = %e, "Supervised operation failed");
                            SupervisedOutcome::Failed(e.to_string())
                        }
                    };
                }
                _ = &mut deadline => {
                    warn!(slot = slot, timeout_secs = timeout.as_secs(), "Supervised operation timed out");
                    on_timeout(timeout);
                    // Dropping the handle detaches the task; its result is discarded
                    return SupervisedOutcome::TimedOut { after: timeout };
                }
                _ = ticker.tick() => {
                    elapsed_secs += 1;
                    on_progress(Progress {
                        elapsed_secs,
                        level: self.level_at(elapsed_secs),
                    });
                }
            }
        }
    }
}
