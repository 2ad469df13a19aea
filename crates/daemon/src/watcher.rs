//! Recursive filesystem watch on the incoming root, feeding the [`IntakeDebouncer`].

use crate::debounce::IntakeDebouncer;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Keeps the notification backend alive; dropping it stops the watch.
pub struct IntakeWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl IntakeWatcher {
    /// Watch `root` recursively and record every relevant event in `debouncer`.
    pub fn start(root: &Path, debouncer: Arc<IntakeDebouncer>) -> Result<Self, WatchError> {
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => handle_event(&debouncer, event),
                Err(e) => warn!(error = %e, "Filesystem watch error"),
            },
            Config::default(),
        )
        .map_err(WatchError::Create)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: root.to_path_buf(),
                source,
            })?;

        info!(root = %root.display(), "Watching incoming root");
        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Whether an event counts as intake activity. Reads (including our own probes) do not.
fn is_intake_activity(kind: &EventKind) -> bool {
    !matches!(kind, EventKind::Access(_))
}

fn handle_event(debouncer: &IntakeDebouncer, event: Event) {
    if !is_intake_activity(&event.kind) {
        return;
    }
    let Some(path) = event.paths.first() else {
        return;
    };
    if debouncer.record(path) {
        debug!(path = %path.display(), kind = ?event.kind, "Intake activity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, ModifyKind};
    use std::time::Duration;

    #[test]
    fn test_access_events_are_ignored() {
        let debouncer = IntakeDebouncer::new();
        let event = Event::new(EventKind::Access(AccessKind::Any)).add_path("/in/a.mkv".into());
        handle_event(&debouncer, event);
        assert!(debouncer.last_event_path().is_none());
    }

    #[test]
    fn test_write_events_are_recorded() {
        let debouncer = IntakeDebouncer::new();
        let event = Event::new(EventKind::Modify(ModifyKind::Any)).add_path("/in/a.mkv".into());
        handle_event(&debouncer, event);
        assert_eq!(debouncer.last_event_path(), Some(PathBuf::from("/in/a.mkv")));
        assert!(!debouncer.quiescent_for(Duration::from_secs(30)));
    }

    #[test]
    fn test_watch_records_new_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let debouncer = Arc::new(IntakeDebouncer::new());
        let _watcher = IntakeWatcher::start(temp_dir.path(), debouncer.clone()).unwrap();

        std::fs::write(temp_dir.path().join("new.mkv"), b"data").unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if debouncer.last_event_path().is_some() {
                seen = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(seen, "watcher never reported the new file");
    }

    #[test]
    fn test_watch_missing_root_fails() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let result = IntakeWatcher::start(
            &temp_dir.path().join("missing"),
            Arc::new(IntakeDebouncer::new()),
        );
        assert!(matches!(result, Err(WatchError::Watch { .. })));
    }
}
