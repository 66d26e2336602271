//! Device hotplug notifications
//!
//! Watches `/dev/input` for event nodes appearing and disappearing.
//! New nodes are reported only after a settle delay: the device manager
//! fixes up permissions after the node is created, and opening it
//! earlier fails.
//!
//! When the kernel queue overflows, individual notifications are lost and
//! the watcher asks for a rescan of the whole directory instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::registry::is_event_node;

/// A device node came or went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Added(PathBuf),
    Removed(PathBuf),
    /// Notifications were lost; re-read the directory
    Rescan,
}

/// Errors setting up the hotplug channel
#[derive(Debug, thiserror::Error)]
pub enum HotplugError {
    #[error("failed to create hotplug watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Keeps the OS watch alive; dropping it closes the notification channel
pub struct HotplugWatcher {
    _watcher: RecommendedWatcher,
}

impl HotplugWatcher {
    /// Start watching `dir` and return the settled notification stream
    ///
    /// Must be called from within the tokio runtime.
    pub fn start(
        dir: &Path,
        settle: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HotplugEvent>), HotplugError> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<HotplugEvent>();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for notice in notices_from(&event) {
                        let _ = raw_tx.send(notice);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "hotplug watcher error, rescanning");
                    let _ = raw_tx.send(HotplugEvent::Rescan);
                }
            }
        })
        .map_err(HotplugError::Create)?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| HotplugError::Watch {
                path: dir.to_owned(),
                source,
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(notice) = raw_rx.recv().await {
                match notice {
                    HotplugEvent::Added(path) => {
                        debug!(path = %path.display(), "device node appeared, settling");
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(settle).await;
                            let _ = tx.send(HotplugEvent::Added(path));
                        });
                    }
                    HotplugEvent::Rescan => {
                        debug!("hotplug notifications lost, settling before rescan");
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(settle).await;
                            let _ = tx.send(HotplugEvent::Rescan);
                        });
                    }
                    removed => {
                        let _ = tx.send(removed);
                    }
                }
            }
            debug!("hotplug forwarder stopped");
        });

        info!(dir = %dir.display(), settle_ms = settle.as_millis() as u64, "hotplug monitoring enabled");
        Ok((Self { _watcher: watcher }, rx))
    }
}

/// Map a filesystem notification onto device add/remove notices
pub fn notices_from(event: &Event) -> Vec<HotplugEvent> {
    if event.need_rescan() {
        return vec![HotplugEvent::Rescan];
    }

    let make: fn(PathBuf) -> HotplugEvent = match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            HotplugEvent::Added
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            HotplugEvent::Removed
        }
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter(|path| is_event_node(path))
        .cloned()
        .map(make)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, Flag, RemoveKind};

    #[test]
    fn test_create_is_added() {
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/dev/input/event21"));
        assert_eq!(
            notices_from(&event),
            vec![HotplugEvent::Added(PathBuf::from("/dev/input/event21"))]
        );
    }

    #[test]
    fn test_remove_is_removed() {
        let event = Event::new(EventKind::Remove(RemoveKind::Any))
            .add_path(PathBuf::from("/dev/input/event21"));
        assert_eq!(
            notices_from(&event),
            vec![HotplugEvent::Removed(PathBuf::from("/dev/input/event21"))]
        );
    }

    #[test]
    fn test_non_event_nodes_ignored() {
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/dev/input/mouse2"))
            .add_path(PathBuf::from("/dev/input/js0"));
        assert!(notices_from(&event).is_empty());
    }

    #[test]
    fn test_access_events_ignored() {
        let event = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/dev/input/event3"));
        assert!(notices_from(&event).is_empty());
    }

    #[test]
    fn test_queue_overflow_requests_rescan() {
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(notices_from(&event), vec![HotplugEvent::Rescan]);

        // The flag wins over whatever paths ride along
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/dev/input/event4"))
            .set_flag(Flag::Rescan);
        assert_eq!(notices_from(&event), vec![HotplugEvent::Rescan]);
    }

    #[test]
    fn test_other_events_without_flag_ignored() {
        let event = Event::new(EventKind::Other);
        assert!(notices_from(&event).is_empty());
    }

    #[tokio::test]
    async fn test_watch_missing_directory_fails() {
        let result = HotplugWatcher::start(Path::new("/nonexistent/input"), Duration::ZERO);
        assert!(matches!(result, Err(HotplugError::Watch { .. })));
    }
}
