//! Playback collaborators and the observer that feeds state publication.
//!
//! The rendering engine and media library live outside this crate; the node
//! talks to them only through `PlaybackEngine` and `MediaCatalog`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::lock_or_recover;
use crate::model::{PlaybackStatus, QueueItem, StateDelta};
use crate::state_sync::StateSynchronizer;

pub trait PlaybackEngine: Send + Sync {
    fn play(&self, item: &QueueItem) -> Result<(), String>;
    fn pause(&self) -> Result<(), String>;
    fn resume(&self) -> Result<(), String>;
    fn seek(&self, position: f64) -> Result<(), String>;
    fn set_volume(&self, volume: f64) -> Result<(), String>;
    /// Ends the current item without starting another.
    fn skip(&self) -> Result<(), String>;
}

/// Read-only snapshot of named media collections.
pub trait MediaCatalog: Send + Sync {
    fn collection(&self, name: &str) -> Option<Vec<QueueItem>>;
}

#[derive(Default)]
pub struct InMemoryCatalog {
    collections: HashMap<String, Vec<QueueItem>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, mut items: Vec<QueueItem>) {
        for item in &mut items {
            item.origin_collection.get_or_insert_with(|| name.to_string());
        }
        self.collections.insert(name.to_string(), items);
    }
}

impl MediaCatalog for InMemoryCatalog {
    fn collection(&self, name: &str) -> Option<Vec<QueueItem>> {
        self.collections.get(name).cloned()
    }
}

#[derive(Default)]
struct ObservedPlayback {
    item_id: Option<String>,
    is_playing: bool,
}

/// Turns engine state callbacks into state submissions.
///
/// Item changes and play/pause flips are published immediately; plain
/// position ticks go through the debounce.
pub struct PlaybackObserver {
    sync: Arc<StateSynchronizer>,
    last: Mutex<ObservedPlayback>,
}

impl PlaybackObserver {
    pub fn new(sync: Arc<StateSynchronizer>) -> Self {
        Self {
            sync,
            last: Mutex::new(ObservedPlayback::default()),
        }
    }

    pub fn on_state_change(
        &self,
        video: Option<&QueueItem>,
        time: f64,
        duration: f64,
        is_playing: bool,
    ) {
        let item_id = video.map(|item| item.identity().to_string());
        let immediate = {
            let mut last = lock_or_recover(&self.last);
            let changed = last.item_id != item_id || last.is_playing != is_playing;
            last.item_id = item_id;
            last.is_playing = is_playing;
            changed
        };
        let status = match (video, is_playing) {
            (None, _) => PlaybackStatus::Idle,
            (Some(_), true) => PlaybackStatus::Playing,
            (Some(_), false) => PlaybackStatus::Paused,
        };
        let now_playing = video.map(|item| {
            let mut item = item.clone();
            if item.duration.is_none() && duration > 0.0 {
                item.duration = Some(duration);
            }
            item
        });
        self.sync.submit(
            StateDelta {
                status: Some(status),
                now_playing_video: Some(now_playing),
                current_position: Some(time.max(0.0)),
                ..Default::default()
            },
            immediate,
        );
    }
}

#[derive(Debug, Clone, Default)]
struct PlayerState {
    current: Option<QueueItem>,
    position: f64,
    is_playing: bool,
    volume: f64,
}

/// Headless engine that keeps playback state in memory and reports every
/// change to its observer.
pub struct LocalPlayer {
    state: Mutex<PlayerState>,
    observer: Mutex<Option<Arc<PlaybackObserver>>>,
}

impl Default for LocalPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPlayer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlayerState {
                volume: 1.0,
                ..Default::default()
            }),
            observer: Mutex::new(None),
        }
    }

    pub fn set_observer(&self, observer: Arc<PlaybackObserver>) {
        *lock_or_recover(&self.observer) = Some(observer);
    }

    pub fn current(&self) -> Option<QueueItem> {
        lock_or_recover(&self.state).current.clone()
    }

    pub fn position(&self) -> f64 {
        lock_or_recover(&self.state).position
    }

    pub fn is_playing(&self) -> bool {
        lock_or_recover(&self.state).is_playing
    }

    pub fn volume(&self) -> f64 {
        lock_or_recover(&self.state).volume
    }

    /// Advances the playback clock. Returns `true` once the item has run
    /// past its known duration.
    pub fn advance(&self, seconds: f64) -> bool {
        let finished = {
            let mut state = lock_or_recover(&self.state);
            if !state.is_playing {
                return false;
            }
            state.position += seconds;
            match state.current.as_ref().and_then(|item| item.duration) {
                Some(duration) if state.position >= duration => {
                    state.position = duration;
                    true
                }
                _ => false,
            }
        };
        self.notify();
        finished
    }

    fn notify(&self) {
        let snapshot = lock_or_recover(&self.state).clone();
        let observer = lock_or_recover(&self.observer).clone();
        if let Some(observer) = observer {
            observer.on_state_change(
                snapshot.current.as_ref(),
                snapshot.position,
                snapshot
                    .current
                    .as_ref()
                    .and_then(|item| item.duration)
                    .unwrap_or(0.0),
                snapshot.is_playing,
            );
        }
    }

    fn update(&self, apply: impl FnOnce(&mut PlayerState) -> Result<(), String>) -> Result<(), String> {
        apply(&mut lock_or_recover(&self.state))?;
        self.notify();
        Ok(())
    }
}

impl PlaybackEngine for LocalPlayer {
    fn play(&self, item: &QueueItem) -> Result<(), String> {
        if item.source_ref.trim().is_empty() {
            return Err(format!("item {} has no source", item.identity()));
        }
        debug!("LocalPlayer: playing {}", item.identity());
        self.update(|state| {
            state.current = Some(item.clone());
            state.position = 0.0;
            state.is_playing = true;
            Ok(())
        })
    }

    fn pause(&self) -> Result<(), String> {
        self.update(|state| {
            if state.current.is_none() {
                return Err("nothing is playing".to_string());
            }
            state.is_playing = false;
            Ok(())
        })
    }

    fn resume(&self) -> Result<(), String> {
        self.update(|state| {
            if state.current.is_none() {
                return Err("nothing to resume".to_string());
            }
            state.is_playing = true;
            Ok(())
        })
    }

    fn seek(&self, position: f64) -> Result<(), String> {
        self.update(|state| {
            let Some(current) = state.current.as_ref() else {
                return Err("nothing is playing".to_string());
            };
            let upper = current.duration.unwrap_or(f64::MAX);
            state.position = position.clamp(0.0, upper);
            Ok(())
        })
    }

    fn set_volume(&self, volume: f64) -> Result<(), String> {
        lock_or_recover(&self.state).volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn skip(&self) -> Result<(), String> {
        self.update(|state| {
            state.current = None;
            state.position = 0.0;
            state.is_playing = false;
            Ok(())
        })
    }
}
