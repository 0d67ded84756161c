//! Last-write-wins resolution of remote queue edits against local state.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock_or_recover;
use crate::model::{dedup_by_identity, QueueItem, QueueSnapshot};

/// What to do with a remote-origin queue change.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Local queue state is strictly newer.
    Discard,
    Apply(QueueSnapshot),
    /// A transition is in progress; replay once it ends.
    Defer,
}

/// Decides how a remote queue snapshot stamped `remote_timestamp` relates to
/// the local snapshot last written at `last_queue_update_time`.
pub fn resolve(
    local: &QueueSnapshot,
    last_queue_update_time: i64,
    remote: &QueueSnapshot,
    remote_timestamp: i64,
    transition_locked: bool,
) -> Resolution {
    if transition_locked {
        return Resolution::Defer;
    }
    if last_queue_update_time > remote_timestamp {
        return Resolution::Discard;
    }
    Resolution::Apply(merge(local, remote))
}

/// Remote ordering wins, except that the locally playing item keeps its local
/// index. The priority queue is the remote one with duplicates removed.
pub fn merge(local: &QueueSnapshot, remote: &QueueSnapshot) -> QueueSnapshot {
    // Active entries are deduplicated too, so the playing item has exactly one
    // slot to move.
    let mut active_queue = dedup_by_identity(remote.active_queue.clone());
    let now_playing = local.now_playing.clone();

    if let Some(playing) = now_playing.as_ref() {
        if let Some(local_index) = position_of(&local.active_queue, playing) {
            let item = match position_of(&active_queue, playing) {
                Some(remote_index) => active_queue.remove(remote_index),
                None => playing.clone(),
            };
            let index = local_index.min(active_queue.len());
            active_queue.insert(index, item);
        }
    }

    QueueSnapshot {
        now_playing,
        active_queue,
        priority_queue: dedup_by_identity(remote.priority_queue.clone()),
    }
}

fn position_of(queue: &[QueueItem], item: &QueueItem) -> Option<usize> {
    queue.iter().position(|candidate| candidate == item)
}

/// Short window during which local publication is held after a remote
/// update was applied, so the applied change is not echoed back.
pub struct SuppressionWindow {
    length: Duration,
    until: Mutex<Option<Instant>>,
}

impl SuppressionWindow {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            until: Mutex::new(None),
        }
    }

    pub fn open(&self) {
        if self.length.is_zero() {
            return;
        }
        *lock_or_recover(&self.until) = Some(Instant::now() + self.length);
    }

    /// Instant the window closes, if it is currently open.
    pub fn active_until(&self) -> Option<Instant> {
        let mut until = lock_or_recover(&self.until);
        match *until {
            Some(deadline) if deadline > Instant::now() => Some(deadline),
            Some(_) => {
                *until = None;
                None
            }
            None => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_until().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{merge, resolve, Resolution, SuppressionWindow};
    use crate::model::{QueueItem, QueueSnapshot};
    use std::time::Duration;

    fn item(id: &str) -> QueueItem {
        QueueItem::new(id, id, &format!("{id}.mp4"))
    }

    fn queue(ids: &[&str]) -> Vec<QueueItem> {
        ids.iter().map(|id| item(id)).collect()
    }

    fn ids(items: &[QueueItem]) -> Vec<&str> {
        items.iter().map(QueueItem::identity).collect()
    }

    #[test]
    fn test_locally_newer_queue_discards_remote() {
        let local = QueueSnapshot {
            now_playing: None,
            active_queue: queue(&["a"]),
            priority_queue: Vec::new(),
        };
        let remote = QueueSnapshot {
            now_playing: None,
            active_queue: queue(&["x"]),
            priority_queue: Vec::new(),
        };
        assert_eq!(resolve(&local, 2_000, &remote, 1_000, false), Resolution::Discard);
        assert!(matches!(
            resolve(&local, 1_000, &remote, 1_000, false),
            Resolution::Apply(_)
        ));
        assert_eq!(resolve(&local, 0, &remote, 1_000, true), Resolution::Defer);
    }

    #[test]
    fn test_merge_keeps_playing_item_at_local_index() {
        let local = QueueSnapshot {
            now_playing: Some(item("b")),
            active_queue: queue(&["b", "a", "c"]),
            priority_queue: Vec::new(),
        };
        let remote = QueueSnapshot {
            now_playing: Some(item("b")),
            active_queue: queue(&["c", "a", "b", "d"]),
            priority_queue: queue(&["p", "q", "p"]),
        };
        let merged = merge(&local, &remote);
        assert_eq!(ids(&merged.active_queue), vec!["b", "c", "a", "d"]);
        assert_eq!(ids(&merged.priority_queue), vec!["p", "q"]);
        assert_eq!(merged.now_playing, Some(item("b")));
    }

    #[test]
    fn test_merge_reinserts_playing_item_removed_remotely() {
        let local = QueueSnapshot {
            now_playing: Some(item("b")),
            active_queue: queue(&["b", "c"]),
            priority_queue: Vec::new(),
        };
        let remote = QueueSnapshot {
            now_playing: None,
            active_queue: queue(&["c", "e"]),
            priority_queue: Vec::new(),
        };
        let merged = merge(&local, &remote);
        assert_eq!(ids(&merged.active_queue), vec!["b", "c", "e"]);
    }

    #[test]
    fn test_merge_without_playing_item_takes_remote_order() {
        let local = QueueSnapshot::default();
        let remote = QueueSnapshot {
            now_playing: None,
            active_queue: queue(&["c", "a", "c"]),
            priority_queue: Vec::new(),
        };
        assert_eq!(ids(&merge(&local, &remote).active_queue), vec!["c", "a"]);
    }

    #[test]
    fn test_merge_gives_duplicated_playing_item_one_slot() {
        let local = QueueSnapshot {
            now_playing: Some(item("b")),
            active_queue: queue(&["b", "c"]),
            priority_queue: Vec::new(),
        };
        let remote = QueueSnapshot {
            now_playing: Some(item("b")),
            active_queue: queue(&["c", "b", "a", "b"]),
            priority_queue: Vec::new(),
        };
        assert_eq!(ids(&merge(&local, &remote).active_queue), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_suppression_window_closes_after_length() {
        let window = SuppressionWindow::new(Duration::from_millis(30));
        assert!(!window.is_active());
        window.open();
        assert!(window.is_active());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!window.is_active());
    }
}
