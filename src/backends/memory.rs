//! In-process backend with fault injection.
//!
//! Pub/sub and change feeds fan out over `std::sync::mpsc` senders kept per
//! node; a sender whose receiver was dropped is pruned on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::backends::{ChannelEvent, SyncBackend};
use crate::connection_monitor::LifecycleEvent;
use crate::error::SyncError;
use crate::lock_or_recover;
use crate::model::{
    now_unix_ms, Command, CommandEnvelope, CommandStatus, ExecutionRecord, RemoteStateChange,
    StateDelta, StateRecord,
};

#[derive(Default)]
struct MemoryStore {
    records: HashMap<String, StateRecord>,
    commands: Vec<Command>,
    state_writes: Vec<StateDelta>,
    write_instants: Vec<Instant>,
    status_updates: Vec<(String, ExecutionRecord)>,
    heartbeats: Vec<(String, i64)>,
    last_timestamp: i64,
}

impl MemoryStore {
    fn next_timestamp(&mut self) -> i64 {
        let timestamp = now_unix_ms().max(self.last_timestamp.saturating_add(1));
        self.last_timestamp = timestamp;
        timestamp
    }
}

#[derive(Default)]
struct ChannelHub {
    command_subscribers: Mutex<HashMap<String, Vec<Sender<ChannelEvent>>>>,
    state_subscribers: Mutex<HashMap<String, Vec<Sender<RemoteStateChange>>>>,
}

impl ChannelHub {
    fn subscribe_commands(&self, node_id: &str) -> Receiver<ChannelEvent> {
        let (tx, rx) = channel();
        let _ = tx.send(ChannelEvent::Lifecycle(LifecycleEvent::Subscribed));
        lock_or_recover(&self.command_subscribers)
            .entry(node_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn broadcast_commands(&self, node_id: &str, event: ChannelEvent) -> usize {
        let mut subscribers = lock_or_recover(&self.command_subscribers);
        let Some(senders) = subscribers.get_mut(node_id) else {
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    fn subscribe_state(&self, node_id: &str) -> Receiver<RemoteStateChange> {
        let (tx, rx) = channel();
        lock_or_recover(&self.state_subscribers)
            .entry(node_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn broadcast_state(&self, change: RemoteStateChange) {
        let mut subscribers = lock_or_recover(&self.state_subscribers);
        if let Some(senders) = subscribers.get_mut(&change.record.node_id) {
            senders.retain(|tx| tx.send(change.clone()).is_ok());
        }
    }
}

/// Backend kept entirely in process memory.
pub struct MemoryBackend {
    store: Mutex<MemoryStore>,
    hub: ChannelHub,
    available: AtomicBool,
    reject_extended_status: AtomicBool,
    liveness_rpc: AtomicBool,
    failing_polls: AtomicU32,
    failing_state_fetches: AtomicBool,
    poll_count: AtomicU32,
    write_delay_ms: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(MemoryStore::default()),
            hub: ChannelHub::default(),
            available: AtomicBool::new(true),
            reject_extended_status: AtomicBool::new(false),
            liveness_rpc: AtomicBool::new(true),
            failing_polls: AtomicU32::new(0),
            failing_state_fetches: AtomicBool::new(false),
            poll_count: AtomicU32::new(0),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// Makes every subsequent call fail with `TransientNetwork` while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Emulates a deployment whose command log lacks `executedAt`/`result`.
    pub fn set_reject_extended_status(&self, reject: bool) {
        self.reject_extended_status.store(reject, Ordering::SeqCst);
    }

    pub fn set_liveness_rpc_supported(&self, supported: bool) {
        self.liveness_rpc.store(supported, Ordering::SeqCst);
    }

    /// Fails the next `count` command-log polls.
    pub fn fail_next_polls(&self, count: u32) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    /// Fails state-record reads while writes keep working.
    pub fn set_state_fetch_failing(&self, failing: bool) {
        self.failing_state_fetches.store(failing, Ordering::SeqCst);
    }

    pub fn poll_count(&self) -> u32 {
        self.poll_count.load(Ordering::SeqCst)
    }

    /// Adds latency to every state write.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn state_writes(&self) -> Vec<StateDelta> {
        lock_or_recover(&self.store).state_writes.clone()
    }

    /// When each state write reached the backend, in write order.
    pub fn write_instants(&self) -> Vec<Instant> {
        lock_or_recover(&self.store).write_instants.clone()
    }

    pub fn status_updates(&self) -> Vec<(String, ExecutionRecord)> {
        lock_or_recover(&self.store).status_updates.clone()
    }

    pub fn heartbeats(&self) -> Vec<(String, i64)> {
        lock_or_recover(&self.store).heartbeats.clone()
    }

    pub fn seed_record(&self, record: StateRecord) {
        let mut store = lock_or_recover(&self.store);
        store.last_timestamp = store.last_timestamp.max(record.last_updated);
        store.records.insert(record.node_id.clone(), record);
    }

    /// Delivers a lifecycle event to every command subscriber of `node_id`.
    pub fn emit_lifecycle(&self, node_id: &str, event: LifecycleEvent) {
        self.hub
            .broadcast_commands(node_id, ChannelEvent::Lifecycle(event));
    }

    fn ensure_available(&self) -> Result<(), SyncError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::TransientNetwork(
                "memory backend unavailable".to_string(),
            ))
        }
    }
}

impl SyncBackend for MemoryBackend {
    fn fetch_state(&self, node_id: &str) -> Result<Option<StateRecord>, SyncError> {
        self.ensure_available()?;
        if self.failing_state_fetches.load(Ordering::SeqCst) {
            return Err(SyncError::TransientNetwork(
                "state record read failed".to_string(),
            ));
        }
        Ok(lock_or_recover(&self.store).records.get(node_id).cloned())
    }

    fn ensure_state(&self, node_id: &str) -> Result<StateRecord, SyncError> {
        self.ensure_available()?;
        let mut store = lock_or_recover(&self.store);
        if let Some(record) = store.records.get(node_id) {
            return Ok(record.clone());
        }
        let mut record = StateRecord::new(node_id);
        record.last_updated = store.next_timestamp();
        store.records.insert(node_id.to_string(), record.clone());
        Ok(record)
    }

    fn upsert_state(
        &self,
        node_id: &str,
        delta: &StateDelta,
        origin: &str,
    ) -> Result<i64, SyncError> {
        self.ensure_available()?;
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        let change = {
            let mut store = lock_or_recover(&self.store);
            let timestamp = store.next_timestamp();
            let record = store
                .records
                .entry(node_id.to_string())
                .or_insert_with(|| StateRecord::new(node_id));
            delta.apply_to(record);
            record.last_updated = timestamp;
            let snapshot = record.clone();
            store.state_writes.push(delta.clone());
            store.write_instants.push(Instant::now());
            RemoteStateChange {
                record: snapshot,
                origin: origin.to_string(),
                timestamp,
            }
        };
        let timestamp = change.timestamp;
        self.hub.broadcast_state(change);
        Ok(timestamp)
    }

    fn subscribe_state(&self, node_id: &str) -> Result<Receiver<RemoteStateChange>, SyncError> {
        self.ensure_available()?;
        Ok(self.hub.subscribe_state(node_id))
    }

    fn insert_command(&self, command: &Command) -> Result<(), SyncError> {
        self.ensure_available()?;
        let mut store = lock_or_recover(&self.store);
        if store.commands.iter().any(|existing| existing.id == command.id) {
            return Err(SyncError::DuplicateCommand(command.id.clone()));
        }
        store.commands.push(command.clone());
        Ok(())
    }

    fn fetch_command(&self, command_id: &str) -> Result<Option<Command>, SyncError> {
        self.ensure_available()?;
        Ok(lock_or_recover(&self.store)
            .commands
            .iter()
            .find(|command| command.id == command_id)
            .cloned())
    }

    fn fetch_pending_commands(
        &self,
        node_id: &str,
        since_ms: i64,
    ) -> Result<Vec<Command>, SyncError> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_polls.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_polls.store(failing - 1, Ordering::SeqCst);
            return Err(SyncError::TransientNetwork("scripted poll failure".to_string()));
        }
        self.ensure_available()?;
        let store = lock_or_recover(&self.store);
        let mut pending: Vec<Command> = store
            .commands
            .iter()
            .filter(|command| {
                command.target_node_id == node_id
                    && command.status == CommandStatus::Pending
                    && command.issued_at >= since_ms
            })
            .cloned()
            .collect();
        pending.sort_by_key(|command| command.issued_at);
        Ok(pending)
    }

    fn update_command_status(
        &self,
        command_id: &str,
        record: &ExecutionRecord,
    ) -> Result<(), SyncError> {
        self.ensure_available()?;
        if self.reject_extended_status.load(Ordering::SeqCst)
            && (record.executed_at.is_some() || record.result.is_some())
        {
            return Err(SyncError::SchemaMismatch(
                "commands has no column named result".to_string(),
            ));
        }
        let mut store = lock_or_recover(&self.store);
        let Some(command) = store
            .commands
            .iter_mut()
            .find(|command| command.id == command_id)
        else {
            return Err(SyncError::TransientNetwork(format!(
                "unknown command {command_id}"
            )));
        };
        command.status = record.status;
        if record.executed_at.is_some() {
            command.executed_at = record.executed_at;
        }
        if record.result.is_some() {
            command.execution_result = record.result.clone();
        }
        store
            .status_updates
            .push((command_id.to_string(), record.clone()));
        Ok(())
    }

    fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), SyncError> {
        self.ensure_available()?;
        self.hub.broadcast_commands(
            &envelope.command.target_node_id,
            ChannelEvent::Envelope(envelope.clone()),
        );
        Ok(())
    }

    fn subscribe_commands(&self, node_id: &str) -> Result<Receiver<ChannelEvent>, SyncError> {
        self.ensure_available()?;
        Ok(self.hub.subscribe_commands(node_id))
    }

    fn heartbeat(&self, node_id: &str, at_ms: i64) -> Result<(), SyncError> {
        self.ensure_available()?;
        if !self.liveness_rpc.load(Ordering::SeqCst) {
            return Err(SyncError::Unsupported("heartbeat rpc".to_string()));
        }
        let mut store = lock_or_recover(&self.store);
        store.heartbeats.push((format!("rpc:{node_id}"), at_ms));
        if let Some(record) = store.records.get_mut(node_id) {
            record.last_heartbeat = at_ms;
            record.is_online = true;
        }
        Ok(())
    }

    fn touch_heartbeat(&self, node_id: &str, at_ms: i64) -> Result<(), SyncError> {
        self.ensure_available()?;
        let mut store = lock_or_recover(&self.store);
        store.heartbeats.push((format!("field:{node_id}"), at_ms));
        let record = store
            .records
            .entry(node_id.to_string())
            .or_insert_with(|| StateRecord::new(node_id));
        record.last_heartbeat = at_ms;
        record.is_online = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryBackend;
    use crate::backends::{ChannelEvent, SyncBackend};
    use crate::connection_monitor::LifecycleEvent;
    use crate::model::{
        Command, CommandEnvelope, CommandStatus, CommandType, ExecutionRecord, QueueItem,
        StateDelta,
    };

    #[test]
    fn test_upsert_state_preserves_omitted_fields_and_feeds_subscribers() {
        let backend = MemoryBackend::new();
        let feed = backend.subscribe_state("node-1").expect("subscribe state");
        backend
            .upsert_state(
                "node-1",
                &StateDelta {
                    active_queue: Some(vec![QueueItem::new("a", "A", "a.mp4")]),
                    ..Default::default()
                },
                "admin",
            )
            .expect("first write");
        let second = backend
            .upsert_state(
                "node-1",
                &StateDelta {
                    current_position: Some(4.0),
                    ..Default::default()
                },
                "node-1",
            )
            .expect("second write");

        let record = backend
            .fetch_state("node-1")
            .expect("fetch")
            .expect("record exists");
        assert_eq!(record.active_queue.len(), 1);
        assert_eq!(record.current_position, 4.0);
        assert_eq!(record.last_updated, second);

        let first_change = feed.try_recv().expect("first change delivered");
        assert_eq!(first_change.origin, "admin");
        let second_change = feed.try_recv().expect("second change delivered");
        assert!(second_change.timestamp > first_change.timestamp);
    }

    #[test]
    fn test_publish_reaches_only_matching_node_subscribers() {
        let backend = MemoryBackend::new();
        let node_one = backend.subscribe_commands("node-1").expect("subscribe");
        let node_two = backend.subscribe_commands("node-2").expect("subscribe");
        assert_eq!(
            node_one.try_recv().expect("subscribed event"),
            ChannelEvent::Lifecycle(LifecycleEvent::Subscribed)
        );
        let _ = node_two.try_recv();

        let command = Command::new("node-1", CommandType::Pause, serde_json::Value::Null, "admin", 1);
        backend
            .publish_command(&CommandEnvelope {
                command: command.clone(),
                timestamp: 1,
            })
            .expect("publish");

        assert!(matches!(node_one.try_recv(), Ok(ChannelEvent::Envelope(_))));
        assert!(node_two.try_recv().is_err());

        backend.emit_lifecycle("node-1", LifecycleEvent::Closed);
        assert_eq!(
            node_one.try_recv().expect("closed event"),
            ChannelEvent::Lifecycle(LifecycleEvent::Closed)
        );
    }

    #[test]
    fn test_rejected_extended_status_accepts_reduced_record() {
        let backend = MemoryBackend::new();
        backend.set_reject_extended_status(true);
        let command = Command::new("node-1", CommandType::Skip, serde_json::Value::Null, "kiosk", 1);
        backend.insert_command(&command).expect("insert");

        let full = ExecutionRecord::completed(None, 5);
        assert!(backend.update_command_status(&command.id, &full).is_err());
        backend
            .update_command_status(&command.id, &full.reduced())
            .expect("reduced update accepted");
        let stored = backend
            .fetch_command(&command.id)
            .expect("fetch")
            .expect("command exists");
        assert_eq!(stored.status, CommandStatus::Completed);
        assert!(stored.execution_result.is_none());
    }

    #[test]
    fn test_fail_next_polls_then_recovers() {
        let backend = MemoryBackend::new();
        backend.fail_next_polls(2);
        assert!(backend.fetch_pending_commands("node-1", 0).is_err());
        assert!(backend.fetch_pending_commands("node-1", 0).is_err());
        assert!(backend.fetch_pending_commands("node-1", 0).is_ok());
        assert_eq!(backend.poll_count(), 3);
    }
}
