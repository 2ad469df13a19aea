//! Intake debouncing.
//!
//! Downloads arrive as bursts of filesystem events. The watcher records every event here
//! and the control loop only scans once no event has been seen for the quiescence window.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct DebounceState {
    last_event_at: Option<Instant>,
    last_event_path: Option<PathBuf>,
}

/// Time and path of the most recent filesystem event under the incoming root.
#[derive(Debug, Default)]
pub struct IntakeDebouncer {
    state: Mutex<DebounceState>,
}

impl IntakeDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        // The state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an event for `path` happening now.
    ///
    /// Returns `true` when `path` differs from the previously recorded event path.
    pub fn record(&self, path: &Path) -> bool {
        self.record_at(path, Instant::now())
    }

    /// Record an event observed at `at`. The stored time never moves backwards.
    pub fn record_at(&self, path: &Path, at: Instant) -> bool {
        let mut state = self.lock();
        state.last_event_at = Some(match state.last_event_at {
            Some(previous) if previous > at => previous,
            _ => at,
        });
        let is_new = state.last_event_path.as_deref() != Some(path);
        if is_new {
            state.last_event_path = Some(path.to_path_buf());
        }
        is_new
    }

    /// True when no event has been recorded within the last `window`, or none at all.
    pub fn quiescent_for(&self, window: Duration) -> bool {
        self.quiescent_for_at(window, Instant::now())
    }

    pub fn quiescent_for_at(&self, window: Duration, now: Instant) -> bool {
        match self.lock().last_event_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= window,
        }
    }

    pub fn last_event_path(&self) -> Option<PathBuf> {
        self.lock().last_event_path.clone()
    }
}
