//! Authoritative local play queue and the default command handlers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::command_channel::CommandChannel;
use crate::lock_or_recover;
use crate::model::{dedup_by_identity, Command, CommandType, QueueItem, QueueSnapshot, StateDelta};
use crate::playback::{MediaCatalog, PlaybackEngine};
use crate::state_sync::StateSynchronizer;

struct QueueState {
    snapshot: QueueSnapshot,
    rng_seed: [u8; 32],
}

/// Node-local copy of the now-playing item and both queues.
///
/// `active_queue[0]` is the playing item whenever one is set.
pub struct PlayQueue {
    state: Mutex<QueueState>,
}

impl Default for PlayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayQueue {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        if let Err(err) = getrandom::fill(&mut seed) {
            debug!("PlayQueue: random seed unavailable, using fixed seed: {}", err);
        }
        Self {
            state: Mutex::new(QueueState {
                snapshot: QueueSnapshot::default(),
                rng_seed: seed,
            }),
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        lock_or_recover(&self.state).snapshot.clone()
    }

    pub fn now_playing(&self) -> Option<QueueItem> {
        lock_or_recover(&self.state).snapshot.now_playing.clone()
    }

    /// Replaces the queues, e.g. after a remote edit was merged.
    pub fn replace(&self, snapshot: QueueSnapshot) {
        let mut state = lock_or_recover(&self.state);
        state.snapshot = snapshot;
        enforce_head(&mut state.snapshot);
    }

    /// Inserts `items` into the active queue. Position 0 is reserved for the
    /// playing item, so insertion points are clamped behind it.
    pub fn add(&self, items: Vec<QueueItem>, position: Option<usize>) -> usize {
        let mut state = lock_or_recover(&self.state);
        let snapshot = &mut state.snapshot;
        let existing: HashSet<String> = snapshot
            .active_queue
            .iter()
            .map(|item| item.identity().to_string())
            .collect();
        let fresh: Vec<QueueItem> = dedup_by_identity(items)
            .into_iter()
            .filter(|item| !existing.contains(item.identity()))
            .collect();
        let floor = usize::from(snapshot.now_playing.is_some()).min(snapshot.active_queue.len());
        let index = position
            .unwrap_or(snapshot.active_queue.len())
            .clamp(floor, snapshot.active_queue.len());
        let added = fresh.len();
        snapshot.active_queue.splice(index..index, fresh);
        added
    }

    pub fn remove(&self, id: &str) -> Result<QueueItem, String> {
        let mut state = lock_or_recover(&self.state);
        let snapshot = &mut state.snapshot;
        if snapshot
            .now_playing
            .as_ref()
            .is_some_and(|item| item.identity() == id)
        {
            return Err(format!("{id} is playing; skip it instead"));
        }
        if let Some(index) = snapshot
            .priority_queue
            .iter()
            .position(|item| item.identity() == id)
        {
            return Ok(snapshot.priority_queue.remove(index));
        }
        match snapshot
            .active_queue
            .iter()
            .position(|item| item.identity() == id)
        {
            Some(index) => Ok(snapshot.active_queue.remove(index)),
            None => Err(format!("{id} is not queued")),
        }
    }

    /// Empties both queues except for the playing item.
    pub fn clear(&self) -> usize {
        let mut state = lock_or_recover(&self.state);
        let snapshot = &mut state.snapshot;
        let before = snapshot.active_queue.len() + snapshot.priority_queue.len();
        snapshot.priority_queue.clear();
        snapshot.active_queue.clear();
        if let Some(playing) = snapshot.now_playing.clone() {
            snapshot.active_queue.push(playing);
        }
        before - snapshot.active_queue.len()
    }

    /// Shuffles everything behind the playing item.
    pub fn shuffle(&self) {
        let mut state = lock_or_recover(&self.state);
        let mut rng = StdRng::from_seed(state.rng_seed);
        let skip = usize::from(state.snapshot.now_playing.is_some())
            .min(state.snapshot.active_queue.len());
        state.snapshot.active_queue[skip..].shuffle(&mut rng);
        for byte in state.rng_seed.iter_mut() {
            *byte = byte.wrapping_add(1);
        }
    }

    pub fn move_item(&self, id: &str, to: usize) -> Result<(), String> {
        let mut state = lock_or_recover(&self.state);
        let snapshot = &mut state.snapshot;
        let Some(from) = snapshot
            .active_queue
            .iter()
            .position(|item| item.identity() == id)
        else {
            return Err(format!("{id} is not queued"));
        };
        let floor = usize::from(snapshot.now_playing.is_some());
        if from < floor {
            return Err(format!("{id} is playing and stays first"));
        }
        let item = snapshot.active_queue.remove(from);
        let to = to.clamp(floor, snapshot.active_queue.len());
        snapshot.active_queue.insert(to, item);
        Ok(())
    }

    pub fn priority_add(&self, items: Vec<QueueItem>) -> usize {
        let mut state = lock_or_recover(&self.state);
        let snapshot = &mut state.snapshot;
        let before = snapshot.priority_queue.len();
        let mut merged = std::mem::take(&mut snapshot.priority_queue);
        merged.extend(items);
        snapshot.priority_queue = dedup_by_identity(merged);
        snapshot.priority_queue.len() - before
    }

    /// Replaces the active queue, keeping the playing item at its head.
    pub fn load(&self, items: Vec<QueueItem>) -> usize {
        let mut state = lock_or_recover(&self.state);
        state.snapshot.active_queue = dedup_by_identity(items);
        enforce_head(&mut state.snapshot);
        state.snapshot.active_queue.len()
    }

    /// Drops the playing item and promotes the next one: the priority queue
    /// first, then the active queue.
    pub fn advance(&self) -> Option<QueueItem> {
        let mut state = lock_or_recover(&self.state);
        let snapshot = &mut state.snapshot;
        if snapshot.now_playing.take().is_some() && !snapshot.active_queue.is_empty() {
            snapshot.active_queue.remove(0);
        }
        let next = if snapshot.priority_queue.is_empty() {
            snapshot.active_queue.first().cloned()
        } else {
            Some(snapshot.priority_queue.remove(0))
        };
        snapshot.now_playing = next.clone();
        enforce_head(snapshot);
        next
    }

    /// Marks `item` as playing, moving it to the head of the active queue.
    pub fn start(&self, item: QueueItem) {
        let mut state = lock_or_recover(&self.state);
        state.snapshot.now_playing = Some(item);
        enforce_head(&mut state.snapshot);
    }

    /// Submits the whole queue state for immediate publication.
    pub fn publish(&self, sync: &StateSynchronizer) {
        sync.submit(StateDelta::from_queue_snapshot(&self.snapshot()), true);
    }
}

fn enforce_head(snapshot: &mut QueueSnapshot) {
    let Some(playing) = snapshot.now_playing.as_ref() else {
        return;
    };
    if snapshot.active_queue.first() == Some(playing) {
        return;
    }
    let item = match snapshot.active_queue.iter().position(|item| item == playing) {
        Some(index) => snapshot.active_queue.remove(index),
        None => playing.clone(),
    };
    snapshot.active_queue.insert(0, item);
}

/// Everything the default handlers act on.
pub struct HandlerContext {
    pub engine: Arc<dyn PlaybackEngine>,
    pub queue: Arc<PlayQueue>,
    pub catalog: Arc<dyn MediaCatalog>,
    pub sync: Arc<StateSynchronizer>,
}

fn field<T: DeserializeOwned>(command: &Command, key: &str) -> Result<T, String> {
    let value = command
        .payload
        .get(key)
        .cloned()
        .ok_or_else(|| format!("missing payload field '{key}'"))?;
    serde_json::from_value(value).map_err(|err| format!("invalid payload field '{key}': {err}"))
}

fn optional_field<T: DeserializeOwned>(command: &Command, key: &str) -> Result<Option<T>, String> {
    match command.payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => field(command, key).map(Some),
    }
}

/// Accepts either `{"item": {...}}` or `{"items": [...]}`.
fn payload_items(command: &Command) -> Result<Vec<QueueItem>, String> {
    if let Some(items) = optional_field::<Vec<QueueItem>>(command, "items")? {
        return Ok(items);
    }
    field::<QueueItem>(command, "item").map(|item| vec![item])
}

fn unit_volume(volume: f64) -> Result<f64, String> {
    if !(0.0..=1.0).contains(&volume) {
        return Err(format!("volume {volume} outside 0..1"));
    }
    Ok(volume)
}

impl HandlerContext {
    fn play_item(&self, item: QueueItem) -> Result<Option<Value>, String> {
        let _transition = self.sync.begin_transition();
        self.engine.play(&item)?;
        self.queue.start(item.clone());
        self.queue.publish(&self.sync);
        Ok(Some(json!({ "nowPlaying": item.identity() })))
    }

    fn play(&self, command: &Command) -> Result<Option<Value>, String> {
        if let Some(item) = optional_field::<QueueItem>(command, "item")? {
            return self.play_item(item);
        }
        if let Some(current) = self.queue.now_playing() {
            self.engine.resume().or_else(|_| self.engine.play(&current))?;
            return Ok(Some(json!({ "nowPlaying": current.identity() })));
        }
        match self.queue.advance() {
            Some(next) => self.play_item(next),
            None => Err("queue is empty".to_string()),
        }
    }

    fn skip(&self) -> Result<Option<Value>, String> {
        let _transition = self.sync.begin_transition();
        self.engine.skip()?;
        let next = self.queue.advance();
        if let Some(next) = next.as_ref() {
            self.engine.play(next)?;
        }
        self.queue.publish(&self.sync);
        Ok(Some(json!({
            "nowPlaying": next.as_ref().map(|item| item.identity().to_string())
        })))
    }

    fn set_volume(&self, volume: f64) -> Result<(), String> {
        let volume = unit_volume(volume)?;
        self.engine.set_volume(volume)?;
        self.sync.submit(
            StateDelta {
                volume: Some(volume),
                ..Default::default()
            },
            true,
        );
        Ok(())
    }

    fn settings_update(&self, command: &Command) -> Result<Option<Value>, String> {
        let Some(settings) = command.payload.as_object() else {
            return Err("settings payload must be an object".to_string());
        };
        let mut accepted = Vec::new();
        let mut ignored = Vec::new();
        for (key, value) in settings {
            match key.as_str() {
                "volume" => {
                    let volume = value
                        .as_f64()
                        .ok_or_else(|| "volume must be a number".to_string())?;
                    self.set_volume(volume)?;
                    accepted.push(key.clone());
                }
                _ => ignored.push(key.clone()),
            }
        }
        Ok(Some(json!({ "accepted": accepted, "ignored": ignored })))
    }

    fn load_collection(&self, command: &Command) -> Result<Option<Value>, String> {
        let name: String = field(command, "name")?;
        let items = self
            .catalog
            .collection(&name)
            .ok_or_else(|| format!("unknown collection '{name}'"))?;
        let count = self.queue.load(items);
        info!("Handlers: loaded collection {} ({} items)", name, count);
        if self.queue.now_playing().is_none() {
            if let Some(first) = self.queue.advance() {
                return self
                    .play_item(first)
                    .map(|_| Some(json!({ "collection": name, "count": count })));
            }
        }
        self.queue.publish(&self.sync);
        Ok(Some(json!({ "collection": name, "count": count })))
    }

    pub fn handle(&self, command: &Command) -> Result<Option<Value>, String> {
        match command.command_type {
            CommandType::Play => self.play(command),
            CommandType::Pause => self.engine.pause().map(|_| None),
            CommandType::Resume => self.engine.resume().map(|_| None),
            CommandType::Skip => self.skip(),
            CommandType::SetVolume => {
                let volume: f64 = field(command, "volume")?;
                self.set_volume(volume).map(|_| None)
            }
            CommandType::SeekTo => {
                let position: f64 = field(command, "position")?;
                if position < 0.0 {
                    return Err(format!("position {position} is negative"));
                }
                self.engine.seek(position).map(|_| None)
            }
            CommandType::QueueAdd => {
                let items = payload_items(command)?;
                let position = optional_field::<usize>(command, "position")?;
                let added = self.queue.add(items, position);
                self.queue.publish(&self.sync);
                Ok(Some(json!({ "added": added })))
            }
            CommandType::QueueRemove => {
                let id: String = field(command, "id")?;
                let removed = self.queue.remove(&id)?;
                self.queue.publish(&self.sync);
                Ok(Some(json!({ "removed": removed.identity() })))
            }
            CommandType::QueueClear => {
                let cleared = self.queue.clear();
                self.queue.publish(&self.sync);
                Ok(Some(json!({ "cleared": cleared })))
            }
            CommandType::QueueShuffle => {
                self.queue.shuffle();
                self.queue.publish(&self.sync);
                Ok(None)
            }
            CommandType::QueueMove => {
                let id: String = field(command, "id")?;
                let to: usize = field(command, "to")?;
                self.queue.move_item(&id, to)?;
                self.queue.publish(&self.sync);
                Ok(None)
            }
            CommandType::PriorityAdd => {
                let added = self.queue.priority_add(payload_items(command)?);
                self.queue.publish(&self.sync);
                Ok(Some(json!({ "added": added })))
            }
            CommandType::SettingsUpdate => self.settings_update(command),
            CommandType::LoadCollection => self.load_collection(command),
        }
    }
}

/// Registers a handler for every command type on `channel`.
pub fn register_default_handlers(channel: &CommandChannel, context: Arc<HandlerContext>) {
    for command_type in CommandType::ALL {
        let context = Arc::clone(&context);
        channel.register_handler(
            command_type,
            Arc::new(move |command: &Command| context.handle(command)),
        );
    }
}
