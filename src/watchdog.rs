//! Idle watchdog.
//!
//! Tracks when the server last processed a request item and runs an idle
//! action once the server has been quiet for longer than a threshold.
//!
//! Mutual exclusion with request processing uses two pieces of state:
//! - an async activity gate, held by the request loop while it processes one
//!   item and by the watchdog while the idle action runs
//! - an atomic busy flag, set exactly while the idle action runs
//!
//! The watchdog sleeps until the computed deadline instead of polling, and
//! re-checks idleness after taking the gate since a request may have slipped
//! in while it waited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, MutexGuard};
use tokio::time::Instant;

use crate::config::duration_to_millis;

/// Idle action registered on the server.
pub type IdleHook = Arc<dyn Fn() + Send + Sync>;

/// Last-activity timestamp, busy flag and activity gate of one server.
#[derive(Debug)]
pub struct IdleState {
    last_activity: Mutex<Instant>,
    busy: AtomicBool,
    gate: tokio::sync::Mutex<()>,
}

impl IdleState {
    /// New state with last activity set to now.
    pub fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            busy: AtomicBool::new(false),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Whether the idle action is currently running.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Wait until no idle action runs and hold the gate while processing.
    pub async fn begin_activity(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}

impl Default for IdleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the idle action whenever `state` has been idle for `threshold`.
///
/// Returns when `shutdown` changes or its sender is dropped.
pub async fn run_watchdog(
    state: Arc<IdleState>,
    threshold: Duration,
    hook: IdleHook,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(threshold_ms = duration_to_millis(threshold), "Idle watchdog started");

    loop {
        let idle = state.idle_for();
        if idle < threshold {
            tokio::select! {
                _ = tokio::time::sleep(threshold - idle) => continue,
                _ = shutdown.changed() => break,
            }
        }

        let gate = tokio::select! {
            guard = state.gate.lock() => guard,
            _ = shutdown.changed() => break,
        };

        if state.idle_for() < threshold {
            continue;
        }

        state.busy.store(true, Ordering::Release);
        tracing::debug!(idle_ms = duration_to_millis(state.idle_for()), "Running idle action");

        let action = hook.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || action()).await {
            tracing::warn!(error = %e, "Idle action failed");
        }

        state.touch();
        state.busy.store(false, Ordering::Release);
        drop(gate);
    }

    tracing::debug!("Idle watchdog stopped");
}
