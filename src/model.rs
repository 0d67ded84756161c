//! Shared data model for node state, queue items, and remote commands.
//!
//! Everything in here travels over the wire as camelCase JSON, so field names
//! follow the shared backend contract rather than Rust conventions.

use std::collections::HashSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current wall-clock time in Unix milliseconds.
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// Compares two values by their serialized form.
///
/// `QueueItem` equality is identity-only, so content comparisons (dedup of
/// buffered intent, skip-unchanged writes) go through this instead.
pub fn content_eq<T: Serialize>(left: &T, right: &T) -> bool {
    match (serde_json::to_value(left), serde_json::to_value(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

/// Name serde gives a unit enum variant on the wire.
pub fn wire_name<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(name)) => name,
        _ => String::new(),
    }
}

/// Reads a unit enum variant back from its wire name.
pub fn from_wire_name<T: DeserializeOwned>(name: &str) -> Option<T> {
    serde_json::from_value(Value::String(name.to_string())).ok()
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Playback status published in the state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Playing,
    Paused,
    Buffering,
    Error,
}

impl PlaybackStatus {
    pub fn parse(value: &str) -> Option<Self> {
        from_wire_name(value)
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&wire_name(self))
    }
}

/// One playable entry in the active or priority queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Stable identity. Empty means "use `source_ref`".
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    pub source_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_collection: Option<String>,
}

impl QueueItem {
    pub fn new(id: &str, title: &str, source_ref: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            artist: None,
            source_ref: source_ref.to_string(),
            duration: None,
            origin_collection: None,
        }
    }

    /// Identity used for equality, dedup, and matching across queue rebuilds.
    pub fn identity(&self) -> &str {
        if self.id.trim().is_empty() {
            &self.source_ref
        } else {
            &self.id
        }
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for QueueItem {}

/// Drops repeated items (by identity), keeping the first occurrence.
pub fn dedup_by_identity(items: Vec<QueueItem>) -> Vec<QueueItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.identity().to_string()))
        .collect()
}

/// Durable latest-known snapshot of one node's playback state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub node_id: String,
    #[serde(default)]
    pub status: PlaybackStatus,
    #[serde(default, alias = "currentVideo")]
    pub now_playing_video: Option<QueueItem>,
    #[serde(default)]
    pub current_position: f64,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default)]
    pub active_queue: Vec<QueueItem>,
    #[serde(default)]
    pub priority_queue: Vec<QueueItem>,
    #[serde(default)]
    pub last_updated: i64,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_heartbeat: i64,
}

fn default_volume() -> f64 {
    1.0
}

impl StateRecord {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: PlaybackStatus::Idle,
            now_playing_video: None,
            current_position: 0.0,
            volume: default_volume(),
            active_queue: Vec::new(),
            priority_queue: Vec::new(),
            last_updated: 0,
            is_online: false,
            last_heartbeat: 0,
        }
    }

    /// Deep content comparison ignoring server-managed timestamps.
    pub fn same_content(&self, other: &StateRecord) -> bool {
        let strip = |record: &StateRecord| {
            let mut record = record.clone();
            record.last_updated = 0;
            record.last_heartbeat = 0;
            record
        };
        content_eq(&strip(self), &strip(other))
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            now_playing: self.now_playing_video.clone(),
            active_queue: self.active_queue.clone(),
            priority_queue: self.priority_queue.clone(),
        }
    }

    /// Moves the playing item to the head of `active_queue`.
    ///
    /// If the playing item is missing from the queue it is inserted at index 0.
    pub fn enforce_now_playing_head(&mut self) {
        let Some(now_playing) = self.now_playing_video.as_ref() else {
            return;
        };
        if self.active_queue.first() == Some(now_playing) {
            return;
        }
        let current = match self
            .active_queue
            .iter()
            .position(|item| item == now_playing)
        {
            Some(index) => self.active_queue.remove(index),
            None => now_playing.clone(),
        };
        self.active_queue.insert(0, current);
    }
}

/// Partial state update passed to `StateSynchronizer::submit`.
///
/// `None` means "unchanged". For `now_playing_video`, `Some(None)` explicitly
/// clears the playing item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PlaybackStatus>,
    #[serde(
        default,
        alias = "currentVideo",
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub now_playing_video: Option<Option<QueueItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_queue: Option<Vec<QueueItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_queue: Option<Vec<QueueItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self == &StateDelta::default()
    }

    pub fn touches_queue(&self) -> bool {
        self.active_queue.is_some() || self.priority_queue.is_some()
    }

    /// Folds `newer` on top of `self`; fields present in `newer` win.
    pub fn merge(&mut self, newer: StateDelta) {
        if newer.status.is_some() {
            self.status = newer.status;
        }
        if newer.now_playing_video.is_some() {
            self.now_playing_video = newer.now_playing_video;
        }
        if newer.current_position.is_some() {
            self.current_position = newer.current_position;
        }
        if newer.volume.is_some() {
            self.volume = newer.volume;
        }
        if newer.active_queue.is_some() {
            self.active_queue = newer.active_queue;
        }
        if newer.priority_queue.is_some() {
            self.priority_queue = newer.priority_queue;
        }
        if newer.is_online.is_some() {
            self.is_online = newer.is_online;
        }
        if newer.last_heartbeat.is_some() {
            self.last_heartbeat = newer.last_heartbeat;
        }
    }

    pub fn apply_to(&self, record: &mut StateRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(now_playing) = &self.now_playing_video {
            record.now_playing_video = now_playing.clone();
        }
        if let Some(position) = self.current_position {
            record.current_position = position;
        }
        if let Some(volume) = self.volume {
            record.volume = volume.clamp(0.0, 1.0);
        }
        if let Some(queue) = &self.active_queue {
            record.active_queue = queue.clone();
        }
        if let Some(queue) = &self.priority_queue {
            record.priority_queue = queue.clone();
        }
        if let Some(is_online) = self.is_online {
            record.is_online = is_online;
        }
        if let Some(last_heartbeat) = self.last_heartbeat {
            record.last_heartbeat = last_heartbeat;
        }
    }

    /// Delta carrying every publishable field of `record`.
    pub fn full(record: &StateRecord) -> Self {
        Self {
            status: Some(record.status),
            now_playing_video: Some(record.now_playing_video.clone()),
            current_position: Some(record.current_position),
            volume: Some(record.volume),
            active_queue: Some(record.active_queue.clone()),
            priority_queue: Some(record.priority_queue.clone()),
            is_online: Some(record.is_online),
            last_heartbeat: None,
        }
    }

    /// Delta carrying the queues and the playing item, including a cleared one.
    pub fn from_queue_snapshot(snapshot: &QueueSnapshot) -> Self {
        Self {
            now_playing_video: Some(snapshot.now_playing.clone()),
            active_queue: Some(snapshot.active_queue.clone()),
            priority_queue: Some(snapshot.priority_queue.clone()),
            ..Default::default()
        }
    }
}

/// Queue-affecting fields of a state record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    #[serde(default)]
    pub now_playing: Option<QueueItem>,
    #[serde(default)]
    pub active_queue: Vec<QueueItem>,
    #[serde(default)]
    pub priority_queue: Vec<QueueItem>,
}

/// Queue intent captured while writes were not possible.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedUpdate {
    pub snapshot: QueueSnapshot,
    pub timestamp: i64,
    pub retry_count: u32,
}

/// A state-record change observed on the backend change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStateChange {
    pub record: StateRecord,
    /// Writer identity recorded with the change.
    pub origin: String,
    /// Server timestamp of the write.
    pub timestamp: i64,
}

/// Process-local view of backend connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Operator instruction kinds accepted by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    Play,
    Pause,
    Resume,
    Skip,
    SetVolume,
    SeekTo,
    QueueAdd,
    QueueRemove,
    QueueClear,
    QueueShuffle,
    QueueMove,
    PriorityAdd,
    SettingsUpdate,
    LoadCollection,
}

impl CommandType {
    pub const ALL: [CommandType; 14] = [
        CommandType::Play,
        CommandType::Pause,
        CommandType::Resume,
        CommandType::Skip,
        CommandType::SetVolume,
        CommandType::SeekTo,
        CommandType::QueueAdd,
        CommandType::QueueRemove,
        CommandType::QueueClear,
        CommandType::QueueShuffle,
        CommandType::QueueMove,
        CommandType::PriorityAdd,
        CommandType::SettingsUpdate,
        CommandType::LoadCollection,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        from_wire_name(value)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&wire_name(self))
    }
}

/// Lifecycle of a command in the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn parse(value: &str) -> Option<Self> {
        from_wire_name(value)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&wire_name(self))
    }
}

/// Outcome payload that remote operators read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A discrete operator instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub target_node_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: Value,
    pub issuer: String,
    pub issued_at: i64,
    #[serde(default)]
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
}

impl Command {
    pub fn new(
        target_node_id: &str,
        command_type: CommandType,
        payload: Value,
        issuer: &str,
        issued_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_node_id: target_node_id.to_string(),
            command_type,
            payload,
            issuer: issuer.to_string(),
            issued_at,
            status: CommandStatus::Pending,
            executed_at: None,
            execution_result: None,
        }
    }

    pub fn is_expired(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms.saturating_sub(self.issued_at) > ttl_ms
    }
}

/// Pub/sub payload carrying one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command: Command,
    pub timestamp: i64,
}

/// Status write-back for a command log entry.
///
/// Absent optional fields are left untouched by the backend, which is how the
/// reduced retry payload is expressed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub status: CommandStatus,
    pub executed_at: Option<i64>,
    pub result: Option<ExecutionResult>,
}

impl ExecutionRecord {
    pub fn completed(data: Option<Value>, now_ms: i64) -> Self {
        Self {
            status: CommandStatus::Completed,
            executed_at: Some(now_ms),
            result: Some(ExecutionResult {
                success: true,
                message: None,
                data,
            }),
        }
    }

    pub fn failed(message: impl Into<String>, now_ms: i64) -> Self {
        Self {
            status: CommandStatus::Failed,
            executed_at: Some(now_ms),
            result: Some(ExecutionResult {
                success: false,
                message: Some(message.into()),
                data: None,
            }),
        }
    }

    pub fn skipped_wrong_target(now_ms: i64) -> Self {
        Self {
            status: CommandStatus::Failed,
            executed_at: Some(now_ms),
            result: Some(ExecutionResult {
                success: false,
                message: Some("skipped — wrong target".to_string()),
                data: None,
            }),
        }
    }

    pub fn expired(now_ms: i64) -> Self {
        Self {
            status: CommandStatus::Expired,
            executed_at: Some(now_ms),
            result: None,
        }
    }

    /// Status-only variant used when the backend rejects the full payload.
    pub fn reduced(&self) -> Self {
        Self {
            status: self.status,
            executed_at: None,
            result: None,
        }
    }
}
