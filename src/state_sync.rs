//! Debounced, field-preserving publication of local playback state.
//!
//! `submit()` never blocks on the backend: deltas are merged into one pending
//! delta and a single worker thread writes it once the debounce deadline
//! passes. Writes carry the full merged record so omitted fields can never be
//! cleared remotely.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;

use crate::backends::SyncBackend;
use crate::config::{OfflineConfig, SyncConfig};
use crate::conflict_resolver::{self, Resolution, SuppressionWindow};
use crate::connection_monitor::ConnectionMonitor;
use crate::error::SyncError;
use crate::lock_or_recover;
use crate::log_throttle::LogThrottle;
use crate::model::{
    content_eq, now_unix_ms, BufferedUpdate, QueueSnapshot, RemoteStateChange, StateDelta,
    StateRecord,
};
use crate::offline_buffer::{OfflineBuffer, RetryDecision};
use crate::protocol::{Message, QueueMessage, SyncMessage};

#[derive(Default)]
struct SyncState {
    pending: Option<StateDelta>,
    deadline: Option<Instant>,
    last_synced: Option<StateRecord>,
    last_queue_update_time: i64,
    deferred_remote: Option<RemoteStateChange>,
}

struct SyncInner {
    node_id: String,
    backend: Arc<dyn SyncBackend>,
    monitor: Arc<ConnectionMonitor>,
    bus_producer: Sender<Message>,
    throttle: LogThrottle,
    debounce: Duration,
    state: Mutex<SyncState>,
    wake: Condvar,
    generation: AtomicU64,
    transition_lock: AtomicBool,
    suppression: SuppressionWindow,
    offline: Mutex<OfflineBuffer>,
    flushing: AtomicBool,
    write_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    write_lock: Mutex<()>,
    degraded: AtomicBool,
    stop: AtomicBool,
}

/// Publishes local state to the node's shared record.
pub struct StateSynchronizer {
    inner: Arc<SyncInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Holds the transition lock until dropped.
///
/// While held, queue and playing-item submits are buffered, other fields are
/// held back and remote queue updates are deferred. Release replays all of it.
pub struct TransitionGuard {
    inner: Arc<SyncInner>,
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        self.inner.end_transition();
    }
}

impl StateSynchronizer {
    pub fn new(
        node_id: &str,
        backend: Arc<dyn SyncBackend>,
        monitor: Arc<ConnectionMonitor>,
        bus_producer: Sender<Message>,
        sync_config: &SyncConfig,
        offline_config: &OfflineConfig,
        throttle: LogThrottle,
    ) -> Self {
        let spacing = sync_config.min_write_spacing().max(Duration::from_millis(1));
        let inner = Arc::new(SyncInner {
            node_id: node_id.to_string(),
            backend,
            monitor,
            bus_producer,
            throttle,
            debounce: sync_config.debounce(),
            state: Mutex::new(SyncState::default()),
            wake: Condvar::new(),
            generation: AtomicU64::new(0),
            transition_lock: AtomicBool::new(false),
            suppression: SuppressionWindow::new(sync_config.feedback_suppress()),
            offline: Mutex::new(OfflineBuffer::new(offline_config)),
            flushing: AtomicBool::new(false),
            write_limiter: RateLimiter::direct(
                Quota::with_period(spacing)
                    .expect("valid write spacing period")
                    .allow_burst(NonZeroU32::new(1).expect("non-zero write burst")),
            ),
            write_lock: Mutex::new(()),
            degraded: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = thread::spawn(move || worker_inner.run_worker());

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Uses `record` as the last-synced snapshot, typically the record
    /// returned by startup lookup.
    pub fn seed(&self, record: StateRecord) {
        let mut state = lock_or_recover(&self.inner.state);
        state.last_queue_update_time = state.last_queue_update_time.max(record.last_updated);
        state.last_synced = Some(record);
    }

    /// Switches publication off; submits become warned no-ops.
    pub fn set_degraded(&self, degraded: bool) {
        self.inner.degraded.store(degraded, Ordering::SeqCst);
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// Merges `delta` into the pending write.
    ///
    /// `immediate` cancels any in-flight write and skips the debounce delay.
    pub fn submit(&self, delta: StateDelta, immediate: bool) {
        self.inner.submit(delta, immediate);
    }

    /// Merges `delta` with anything pending and writes it on the calling
    /// thread, returning the server timestamp of the write.
    pub fn submit_and_wait(&self, delta: StateDelta) -> Result<i64, SyncError> {
        self.inner.submit_and_wait(delta)
    }

    /// Runs a remote-origin change through conflict resolution.
    ///
    /// Returns the queue snapshot that was applied locally, if any.
    pub fn apply_remote_update(&self, change: RemoteStateChange) -> Option<QueueSnapshot> {
        self.inner.apply_remote_update(change)
    }

    /// Takes the transition lock, or `None` when a transition is already running.
    pub fn begin_transition(&self) -> Option<TransitionGuard> {
        self.inner
            .transition_lock
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TransitionGuard {
                inner: Arc::clone(&self.inner),
            })
    }

    pub fn is_transition_locked(&self) -> bool {
        self.inner.transition_lock.load(Ordering::SeqCst)
    }

    /// Replays buffered queue intent. Blocks for retry backoff.
    pub fn flush_offline_buffer(&self) {
        self.inner.flush_offline_buffer();
    }

    /// Reconnect hook: replays the offline buffer, then schedules whatever
    /// non-queue fields were held while disconnected.
    pub fn on_connected(&self) {
        self.inner.flush_then_publish();
    }

    pub fn buffered_updates(&self) -> usize {
        lock_or_recover(&self.inner.offline).len()
    }

    pub fn last_synced(&self) -> Option<StateRecord> {
        lock_or_recover(&self.inner.state).last_synced.clone()
    }

    pub fn last_queue_update_time(&self) -> i64 {
        lock_or_recover(&self.inner.state).last_queue_update_time
    }

    pub fn has_pending(&self) -> bool {
        lock_or_recover(&self.inner.state).pending.is_some()
    }

    pub fn shutdown(&self) {
        {
            let _state = lock_or_recover(&self.inner.state);
            self.inner.stop.store(true, Ordering::SeqCst);
        }
        self.inner.wake.notify_all();
        let worker = lock_or_recover(&self.worker).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("StateSync: worker thread panicked");
            }
        }
    }
}

impl Drop for StateSynchronizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SyncInner {
    fn emit(&self, message: Message) {
        let _ = self.bus_producer.send(message);
    }

    /// Last-synced record with the pending delta and the newest buffered
    /// queue intent layered on top.
    fn local_view(&self, state: &SyncState) -> StateRecord {
        let mut view = state
            .last_synced
            .clone()
            .unwrap_or_else(|| StateRecord::new(&self.node_id));
        if let Some(pending) = &state.pending {
            pending.apply_to(&mut view);
        }
        if let Some(buffered) = lock_or_recover(&self.offline).latest() {
            StateDelta::from_queue_snapshot(&buffered.snapshot).apply_to(&mut view);
        }
        view
    }

    fn submit(&self, mut delta: StateDelta, immediate: bool) {
        if delta.is_empty() {
            return;
        }
        if self.degraded.load(Ordering::SeqCst) {
            self.throttle
                .warn("StateSync", "submit", &SyncError::NotInitialized("state record"));
            return;
        }

        let connected = self.monitor.is_connected();
        let mut state = lock_or_recover(&self.state);
        let locked = self.transition_lock.load(Ordering::SeqCst);

        // The playing item travels with the queues: writing it alone onto the
        // cached queue would publish an order that never existed locally.
        let carries_queue_intent = delta.touches_queue() || delta.now_playing_video.is_some();
        if carries_queue_intent && (locked || !connected) {
            let mut view = self.local_view(&state);
            delta.apply_to(&mut view);
            view.enforce_now_playing_head();
            let buffered_entries =
                lock_or_recover(&self.offline).push(view.queue_snapshot(), now_unix_ms());
            debug!(
                "StateSync: buffered queue update ({} entries, connected={}, transition={})",
                buffered_entries, connected, locked
            );
            self.emit(Message::Sync(SyncMessage::QueueBuffered { buffered_entries }));
            delta.active_queue = None;
            delta.priority_queue = None;
            delta.now_playing_video = None;
            if delta.is_empty() {
                return;
            }
        }

        match state.pending.as_mut() {
            Some(pending) => pending.merge(delta),
            None => state.pending = Some(delta),
        }
        // Held fields ride on the replay or are scheduled when the lock drops.
        if connected && !locked {
            self.schedule(&mut state, immediate);
        }
    }

    fn schedule(&self, state: &mut SyncState, immediate: bool) {
        let now = Instant::now();
        // A running debounce window is not extended by later submits.
        let mut deadline = if immediate {
            self.generation.fetch_add(1, Ordering::SeqCst);
            now
        } else {
            state.deadline.unwrap_or(now + self.debounce)
        };
        if let Some(until) = self.suppression.active_until() {
            deadline = deadline.max(until);
        }
        state.deadline = Some(deadline);
        self.wake.notify_all();
    }

    fn run_worker(&self) {
        loop {
            {
                let mut state = lock_or_recover(&self.state);
                loop {
                    if self.stop.load(Ordering::SeqCst) {
                        return;
                    }
                    match state.deadline {
                        Some(deadline) if deadline <= Instant::now() => break,
                        Some(deadline) => {
                            let wait = deadline.saturating_duration_since(Instant::now());
                            state = match self.wake.wait_timeout(state, wait) {
                                Ok((guard, _)) => guard,
                                Err(poisoned) => poisoned.into_inner().0,
                            };
                        }
                        None => {
                            state = match self.wake.wait(state) {
                                Ok(guard) => guard,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                        }
                    }
                }
                state.deadline = None;
                // Submits made while a remote update is settling are held.
                if let Some(until) = self.suppression.active_until() {
                    state.deadline = Some(until);
                    continue;
                }
            }

            let io = lock_or_recover(&self.write_lock);
            let (delta, generation) = {
                let mut state = lock_or_recover(&self.state);
                if self.transition_lock.load(Ordering::SeqCst) {
                    continue;
                }
                match state.pending.take() {
                    Some(delta) => (delta, self.generation.load(Ordering::SeqCst)),
                    None => continue,
                }
            };
            if !self.monitor.is_connected() {
                self.fold_back(delta, false);
                continue;
            }
            let _ = self.write_locked(&io, delta, generation);
        }
    }

    fn submit_and_wait(&self, delta: StateDelta) -> Result<i64, SyncError> {
        if self.degraded.load(Ordering::SeqCst) {
            return Err(SyncError::NotInitialized("state record"));
        }
        if let Some(until) = self.suppression.active_until() {
            thread::sleep(until.saturating_duration_since(Instant::now()));
        }
        // Cancel the worker's in-flight write first so its delta is folded
        // back before pending is taken below.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let io = lock_or_recover(&self.write_lock);
        let (combined, generation) = {
            let mut state = lock_or_recover(&self.state);
            let mut combined = state.pending.take().unwrap_or_default();
            combined.merge(delta);
            state.deadline = None;
            (combined, self.generation.load(Ordering::SeqCst))
        };
        self.write_locked(&io, combined, generation)
    }

    fn wait_for_write_slot(&self) {
        while self.write_limiter.check().is_err() {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Puts `delta` back under whatever was submitted since it was taken.
    fn fold_back(&self, delta: StateDelta, reschedule: bool) {
        let mut state = lock_or_recover(&self.state);
        let mut folded = delta;
        if let Some(newer) = state.pending.take() {
            folded.merge(newer);
        }
        state.pending = Some(folded);
        if reschedule && state.deadline.is_none() {
            state.deadline = Some(Instant::now());
            self.wake.notify_all();
        }
    }

    fn cancelled(&self, delta: StateDelta) -> Result<i64, SyncError> {
        debug!("StateSync: write superseded by a newer request");
        self.fold_back(delta, true);
        Err(SyncError::Cancelled)
    }

    fn write_base(&self) -> (StateRecord, bool) {
        if let Some(record) = lock_or_recover(&self.state).last_synced.clone() {
            return (record, true);
        }
        match self.backend.fetch_state(&self.node_id) {
            Ok(Some(record)) => (record, false),
            Ok(None) => (StateRecord::new(&self.node_id), false),
            Err(err) => {
                self.throttle.warn("StateSync", "snapshot fetch", &err);
                (StateRecord::new(&self.node_id), false)
            }
        }
    }

    /// Merge, write and cache. Caller holds the write lock.
    fn write_locked(
        &self,
        _io: &MutexGuard<'_, ()>,
        delta: StateDelta,
        generation: u64,
    ) -> Result<i64, SyncError> {
        self.wait_for_write_slot();
        if !self.is_current(generation) {
            return self.cancelled(delta);
        }

        let (base, cached) = self.write_base();
        let mut merged = base.clone();
        delta.apply_to(&mut merged);
        merged.enforce_now_playing_head();

        if cached && !delta.touches_queue() && base.same_content(&merged) {
            debug!("StateSync: skipping unchanged write");
            return Ok(base.last_updated);
        }

        let mut outgoing = StateDelta::full(&merged);
        outgoing.is_online = delta.is_online;
        if !self.is_current(generation) {
            return self.cancelled(delta);
        }

        let server_timestamp =
            match self
                .backend
                .upsert_state(&self.node_id, &outgoing, &self.node_id)
            {
                Ok(timestamp) => timestamp,
                Err(err) => {
                    self.throttle.warn("StateSync", "state write", &err);
                    self.emit(Message::Sync(SyncMessage::WriteFailed {
                        error_class: err.class(),
                    }));
                    self.fold_back(delta, false);
                    return Err(err);
                }
            };
        if !self.is_current(generation) {
            return self.cancelled(delta);
        }

        let carried_queue = delta.touches_queue();
        {
            let mut state = lock_or_recover(&self.state);
            merged.last_updated = server_timestamp;
            state.last_synced = Some(merged);
            if carried_queue {
                state.last_queue_update_time = state.last_queue_update_time.max(server_timestamp);
            }
        }
        debug!(
            "StateSync: wrote state at {} (queue={})",
            server_timestamp, carried_queue
        );
        self.emit(Message::Sync(SyncMessage::StateWritten {
            server_timestamp,
            carried_queue,
        }));
        Ok(server_timestamp)
    }

    fn apply_remote_update(&self, change: RemoteStateChange) -> Option<QueueSnapshot> {
        if change.origin == self.node_id {
            return None;
        }
        let locked = self.transition_lock.load(Ordering::SeqCst);
        let mut state = lock_or_recover(&self.state);
        let local = self.local_view(&state).queue_snapshot();
        let remote = change.record.queue_snapshot();

        match conflict_resolver::resolve(
            &local,
            state.last_queue_update_time,
            &remote,
            change.timestamp,
            locked,
        ) {
            Resolution::Defer => {
                debug!(
                    "StateSync: deferring remote update from {} until transition ends",
                    change.origin
                );
                let remote_timestamp = change.timestamp;
                state.deferred_remote = Some(change);
                self.emit(Message::Queue(QueueMessage::RemoteUpdateDeferred {
                    remote_timestamp,
                }));
                None
            }
            Resolution::Discard => {
                debug!(
                    "StateSync: discarding remote queue at {} (local {})",
                    change.timestamp, state.last_queue_update_time
                );
                self.emit(Message::Queue(QueueMessage::RemoteUpdateDiscarded {
                    remote_timestamp: change.timestamp,
                    local_timestamp: state.last_queue_update_time,
                }));
                None
            }
            Resolution::Apply(merged) => {
                self.suppression.open();
                let mut record = state
                    .last_synced
                    .clone()
                    .unwrap_or_else(|| change.record.clone());
                record.active_queue = merged.active_queue.clone();
                record.priority_queue = merged.priority_queue.clone();
                record.last_updated = record.last_updated.max(change.timestamp);
                state.last_synced = Some(record);
                {
                    let mut offline = lock_or_recover(&self.offline);
                    if offline
                        .latest()
                        .is_some_and(|buffered| buffered.timestamp <= change.timestamp)
                    {
                        debug!("StateSync: remote queue supersedes buffered intent");
                        offline.clear();
                    }
                }
                state.last_queue_update_time = state.last_queue_update_time.max(change.timestamp);
                info!(
                    "StateSync: applied remote queue from {} ({} active, {} priority)",
                    change.origin,
                    merged.active_queue.len(),
                    merged.priority_queue.len()
                );
                self.emit(Message::Queue(QueueMessage::RemoteQueueApplied {
                    now_playing: merged.now_playing.clone(),
                    active_queue: merged.active_queue.clone(),
                    priority_queue: merged.priority_queue.clone(),
                }));
                Some(merged)
            }
        }
    }

    fn end_transition(self: &Arc<Self>) {
        self.transition_lock.store(false, Ordering::SeqCst);
        let deferred = lock_or_recover(&self.state).deferred_remote.take();
        if let Some(change) = deferred {
            self.apply_remote_update(change);
        }
        if !self.monitor.is_connected() {
            return;
        }
        let mut state = lock_or_recover(&self.state);
        if lock_or_recover(&self.offline).is_empty() {
            if state.pending.is_some() {
                self.schedule(&mut state, true);
            }
            return;
        }
        drop(state);
        let inner = Arc::clone(self);
        thread::spawn(move || inner.flush_then_publish());
    }

    /// Replays the offline buffer, then schedules whatever non-queue fields
    /// were held meanwhile.
    fn flush_then_publish(&self) {
        self.flush_offline_buffer();
        let mut state = lock_or_recover(&self.state);
        if state.pending.is_some() && !self.transition_lock.load(Ordering::SeqCst) {
            self.schedule(&mut state, true);
        }
    }

    fn flush_offline_buffer(&self) {
        while self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.drain_offline_buffer();
            if !self.end_flush() {
                return;
            }
        }
    }

    /// Releases the flush flag. Returns `true` when an entry was buffered
    /// after the drain stopped and can still be replayed; a flusher that
    /// lost the race for the flag has already given up on it.
    fn end_flush(&self) -> bool {
        self.flushing.store(false, Ordering::SeqCst);
        !self.stop.load(Ordering::SeqCst)
            && self.monitor.is_connected()
            && !self.transition_lock.load(Ordering::SeqCst)
            && !lock_or_recover(&self.offline).is_empty()
    }

    fn drain_offline_buffer(&self) {
        loop {
            if self.stop.load(Ordering::SeqCst)
                || !self.monitor.is_connected()
                || self.transition_lock.load(Ordering::SeqCst)
            {
                break;
            }
            let Some(update) = lock_or_recover(&self.offline).take_latest() else {
                break;
            };
            match self.replay(&update) {
                Ok(timestamp) => {
                    info!("StateSync: replayed buffered queue update at {}", timestamp);
                }
                Err(err) => {
                    self.throttle.warn("StateSync", "offline replay", &err);
                    let retry_count = update.retry_count.saturating_add(1);
                    let decision = lock_or_recover(&self.offline).requeue_failed(update);
                    match decision {
                        RetryDecision::RetryAfter(delay) => self.sleep_while_connected(delay),
                        RetryDecision::Superseded => {}
                        RetryDecision::Exhausted => {
                            warn!(
                                "StateSync: dropping buffered queue update after {} attempts",
                                retry_count
                            );
                            self.emit(Message::Sync(SyncMessage::BufferedUpdateDropped {
                                retry_count,
                            }));
                        }
                    }
                }
            }
        }
    }

    /// Merges a buffered entry with the latest remote snapshot and writes it.
    fn replay(&self, update: &BufferedUpdate) -> Result<i64, SyncError> {
        let known = lock_or_recover(&self.state)
            .last_synced
            .as_ref()
            .map(StateRecord::queue_snapshot);
        let snapshot = match self.backend.fetch_state(&self.node_id)? {
            // Remote queue is what this node last wrote or applied.
            Some(remote)
                if known
                    .as_ref()
                    .is_some_and(|known| same_queues(known, &remote.queue_snapshot())) =>
            {
                update.snapshot.clone()
            }
            Some(remote) => match conflict_resolver::resolve(
                &update.snapshot,
                update.timestamp,
                &remote.queue_snapshot(),
                remote.last_updated,
                false,
            ) {
                Resolution::Apply(merged) => merged,
                Resolution::Discard | Resolution::Defer => update.snapshot.clone(),
            },
            None => update.snapshot.clone(),
        };
        self.submit_and_wait(StateDelta::from_queue_snapshot(&snapshot))
    }

    fn sleep_while_connected(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.stop.load(Ordering::SeqCst) || !self.monitor.is_connected() {
                return;
            }
            thread::sleep(Duration::from_millis(10).min(delay));
        }
    }
}

fn same_queues(left: &QueueSnapshot, right: &QueueSnapshot) -> bool {
    content_eq(&left.active_queue, &right.active_queue)
        && content_eq(&left.priority_queue, &right.priority_queue)
}

#[cfg(test)]
mod tests {
    use super::StateSynchronizer;
    use crate::backends::memory::MemoryBackend;
    use crate::backends::SyncBackend;
    use crate::config::{OfflineConfig, SyncConfig};
    use crate::connection_monitor::ConnectionMonitor;
    use crate::error::SyncError;
    use crate::log_throttle::LogThrottle;
    use crate::model::{
        ConnectionState, PlaybackStatus, QueueItem, RemoteStateChange, StateDelta, StateRecord,
    };
    use crate::protocol::{Message, QueueMessage, SyncMessage};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, Receiver};

    struct Harness {
        backend: Arc<MemoryBackend>,
        monitor: Arc<ConnectionMonitor>,
        sync: StateSynchronizer,
        bus: Receiver<Message>,
    }

    fn harness_with(debounce_ms: u64, suppress_ms: u64) -> Harness {
        harness_spaced(debounce_ms, suppress_ms, 5)
    }

    fn harness_spaced(debounce_ms: u64, suppress_ms: u64, spacing_ms: u64) -> Harness {
        let (bus_sender, bus) = broadcast::channel(256);
        let backend = Arc::new(MemoryBackend::new());
        let monitor = Arc::new(ConnectionMonitor::new(bus_sender.clone()));
        monitor.transition(ConnectionState::Connected);
        let sync = StateSynchronizer::new(
            "node-1",
            backend.clone(),
            monitor.clone(),
            bus_sender,
            &SyncConfig {
                debounce_ms,
                min_write_spacing_ms: spacing_ms,
                feedback_suppress_ms: suppress_ms,
                startup_timeout_ms: 1_000,
            },
            &OfflineConfig {
                buffer_cap: 10,
                retry_base_ms: 10,
                retry_max_ms: 40,
                max_attempts: 3,
            },
            LogThrottle::new(Duration::from_secs(30)),
        );
        Harness {
            backend,
            monitor,
            sync,
            bus,
        }
    }

    fn harness() -> Harness {
        harness_with(40, 50)
    }

    fn item(id: &str) -> QueueItem {
        QueueItem::new(id, id, &format!("{id}.mp4"))
    }

    fn queue(ids: &[&str]) -> Vec<QueueItem> {
        ids.iter().map(|id| item(id)).collect()
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn drain(bus: &mut Receiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = bus.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn remote_change(ids: &[&str], timestamp: i64, origin: &str) -> RemoteStateChange {
        let mut record = StateRecord::new("node-1");
        record.active_queue = queue(ids);
        record.last_updated = timestamp;
        RemoteStateChange {
            record,
            origin: origin.to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_burst_within_debounce_window_collapses_into_one_write() {
        let harness = harness_with(150, 50);
        harness.sync.submit(
            StateDelta {
                status: Some(PlaybackStatus::Playing),
                ..Default::default()
            },
            false,
        );
        thread::sleep(Duration::from_millis(40));
        harness.sync.submit(
            StateDelta {
                current_position: Some(5.0),
                ..Default::default()
            },
            false,
        );

        assert!(wait_until(Duration::from_secs(2), || {
            !harness.backend.state_writes().is_empty()
        }));
        thread::sleep(Duration::from_millis(250));
        let writes = harness.backend.state_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].status, Some(PlaybackStatus::Playing));
        assert_eq!(writes[0].current_position, Some(5.0));
    }

    #[test]
    fn test_omitted_queue_is_preserved_in_later_writes() {
        let harness = harness();
        harness
            .sync
            .submit_and_wait(StateDelta {
                active_queue: Some(queue(&["a", "b", "c"])),
                ..Default::default()
            })
            .expect("queue write");
        harness
            .sync
            .submit_and_wait(StateDelta {
                current_position: Some(5.0),
                ..Default::default()
            })
            .expect("position write");

        let writes = harness.backend.state_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].active_queue.as_ref().map(Vec::len), Some(3));
        let record = harness
            .backend
            .fetch_state("node-1")
            .expect("fetch")
            .expect("record");
        assert_eq!(record.active_queue, queue(&["a", "b", "c"]));
        assert_eq!(record.current_position, 5.0);
    }

    #[test]
    fn test_written_queue_starts_with_now_playing_item() {
        let harness = harness();
        harness.sync.submit(
            StateDelta {
                now_playing_video: Some(Some(item("b"))),
                active_queue: Some(queue(&["a", "b", "c"])),
                ..Default::default()
            },
            true,
        );
        assert!(wait_until(Duration::from_secs(2), || {
            !harness.backend.state_writes().is_empty()
        }));
        let written = harness.backend.state_writes()[0]
            .active_queue
            .clone()
            .expect("queue present");
        assert_eq!(written[0].id, "b");
        assert_eq!(written.len(), 3);
    }

    #[test]
    fn test_unchanged_non_queue_write_is_skipped_but_queue_write_is_not() {
        let harness = harness();
        let position = StateDelta {
            current_position: Some(3.0),
            ..Default::default()
        };
        harness.sync.submit_and_wait(position.clone()).expect("first");
        harness.sync.submit_and_wait(position).expect("second");
        assert_eq!(harness.backend.state_writes().len(), 1);

        let queue_delta = StateDelta {
            active_queue: Some(queue(&["a"])),
            ..Default::default()
        };
        harness.sync.submit_and_wait(queue_delta.clone()).expect("queue");
        harness.sync.submit_and_wait(queue_delta).expect("same queue");
        assert_eq!(harness.backend.state_writes().len(), 3);
        assert!(harness.sync.last_queue_update_time() > 0);
    }

    #[test]
    fn test_immediate_submit_supersedes_in_flight_write() {
        let harness = harness();
        harness.backend.set_write_delay(Duration::from_millis(120));
        harness.sync.submit(
            StateDelta {
                current_position: Some(1.0),
                ..Default::default()
            },
            true,
        );
        thread::sleep(Duration::from_millis(30));
        harness.sync.submit(
            StateDelta {
                volume: Some(0.5),
                ..Default::default()
            },
            true,
        );

        assert!(wait_until(Duration::from_secs(3), || {
            harness
                .sync
                .last_synced()
                .map(|record| record.volume == 0.5 && record.current_position == 1.0)
                .unwrap_or(false)
        }));
        assert!(!harness.sync.has_pending());
    }

    #[test]
    fn test_failed_write_stays_pending_and_rides_on_next_submit() {
        let mut harness = harness();
        harness.backend.set_available(false);
        harness.sync.submit(
            StateDelta {
                current_position: Some(7.0),
                ..Default::default()
            },
            true,
        );
        assert!(wait_until(Duration::from_secs(2), || {
            drain(&mut harness.bus).iter().any(|message| {
                matches!(message, Message::Sync(SyncMessage::WriteFailed { .. }))
            })
        }));
        assert!(harness.sync.has_pending());

        harness.backend.set_available(true);
        harness.sync.submit(
            StateDelta {
                volume: Some(0.25),
                ..Default::default()
            },
            true,
        );
        assert!(wait_until(Duration::from_secs(2), || {
            harness
                .backend
                .fetch_state("node-1")
                .ok()
                .flatten()
                .map(|record| record.current_position == 7.0 && record.volume == 0.25)
                .unwrap_or(false)
        }));
    }

    #[test]
    fn test_identical_queue_submits_while_disconnected_buffer_once() {
        let harness = harness();
        harness.monitor.transition(ConnectionState::Disconnected);
        for _ in 0..3 {
            harness.sync.submit(
                StateDelta {
                    active_queue: Some(queue(&["a", "b"])),
                    ..Default::default()
                },
                false,
            );
        }
        assert_eq!(harness.sync.buffered_updates(), 1);
        thread::sleep(Duration::from_millis(100));
        assert!(harness.backend.state_writes().is_empty());
    }

    #[test]
    fn test_reconnect_replays_only_latest_buffered_queue() {
        let harness = harness();
        harness.monitor.transition(ConnectionState::Disconnected);
        harness.sync.submit(
            StateDelta {
                active_queue: Some(queue(&["a"])),
                ..Default::default()
            },
            false,
        );
        harness.sync.submit(
            StateDelta {
                active_queue: Some(queue(&["a", "b"])),
                ..Default::default()
            },
            false,
        );
        assert_eq!(harness.sync.buffered_updates(), 2);

        harness.monitor.transition(ConnectionState::Connected);
        harness.sync.on_connected();
        thread::sleep(Duration::from_millis(100));

        let writes = harness.backend.state_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].active_queue, Some(queue(&["a", "b"])));
        assert_eq!(harness.sync.buffered_updates(), 0);
    }

    #[test]
    fn test_replay_gives_up_after_max_attempts() {
        let mut harness = harness();
        harness.monitor.transition(ConnectionState::Disconnected);
        harness.sync.submit(
            StateDelta {
                priority_queue: Some(queue(&["p"])),
                ..Default::default()
            },
            false,
        );
        harness.backend.set_available(false);
        harness.monitor.transition(ConnectionState::Connected);
        harness.sync.flush_offline_buffer();

        assert_eq!(harness.sync.buffered_updates(), 0);
        let dropped = drain(&mut harness.bus).into_iter().any(|message| {
            matches!(
                message,
                Message::Sync(SyncMessage::BufferedUpdateDropped { retry_count: 3 })
            )
        });
        assert!(dropped);
    }

    #[test]
    fn test_older_remote_queue_is_discarded() {
        let mut harness = harness();
        let written = harness
            .sync
            .submit_and_wait(StateDelta {
                active_queue: Some(queue(&["a"])),
                ..Default::default()
            })
            .expect("local queue write");
        drain(&mut harness.bus);

        let applied = harness
            .sync
            .apply_remote_update(remote_change(&["x"], written - 1, "admin"));
        assert!(applied.is_none());
        assert!(drain(&mut harness.bus).iter().any(|message| matches!(
            message,
            Message::Queue(QueueMessage::RemoteUpdateDiscarded { .. })
        )));
        assert_eq!(
            harness.sync.last_synced().map(|record| record.active_queue),
            Some(queue(&["a"]))
        );
    }

    #[test]
    fn test_newer_remote_queue_is_applied_and_own_origin_ignored() {
        let harness = harness();
        assert!(harness
            .sync
            .apply_remote_update(remote_change(&["x"], 10, "node-1"))
            .is_none());

        let applied = harness
            .sync
            .apply_remote_update(remote_change(&["x", "y", "x"], 10, "admin"))
            .expect("remote applied");
        assert_eq!(applied.active_queue, queue(&["x", "y"]));
        assert_eq!(harness.sync.last_queue_update_time(), 10);
    }

    #[test]
    fn test_submits_during_suppression_window_are_held_then_written() {
        let harness = harness_with(10, 200);
        harness
            .sync
            .apply_remote_update(remote_change(&["x"], 10, "admin"))
            .expect("applied");
        harness.sync.submit(
            StateDelta {
                current_position: Some(2.0),
                ..Default::default()
            },
            true,
        );
        thread::sleep(Duration::from_millis(80));
        assert!(harness.backend.state_writes().is_empty());
        assert!(wait_until(Duration::from_secs(2), || {
            !harness.backend.state_writes().is_empty()
        }));
    }

    #[test]
    fn test_transition_lock_defers_remote_and_buffers_queue() {
        let mut harness = harness();
        let guard = harness.sync.begin_transition().expect("lock free");
        assert!(harness.sync.begin_transition().is_none());

        assert!(harness
            .sync
            .apply_remote_update(remote_change(&["r"], 10, "admin"))
            .is_none());
        harness.sync.submit(
            StateDelta {
                active_queue: Some(queue(&["local"])),
                ..Default::default()
            },
            false,
        );
        assert_eq!(harness.sync.buffered_updates(), 1);
        thread::sleep(Duration::from_millis(80));
        assert!(harness.backend.state_writes().is_empty());

        drop(guard);
        assert!(!harness.sync.is_transition_locked());
        assert!(wait_until(Duration::from_secs(2), || {
            !harness.backend.state_writes().is_empty()
        }));
        let messages = drain(&mut harness.bus);
        assert!(messages.iter().any(|message| matches!(
            message,
            Message::Queue(QueueMessage::RemoteUpdateDeferred { .. })
        )));
        assert!(messages.iter().any(|message| matches!(
            message,
            Message::Queue(QueueMessage::RemoteQueueApplied { .. })
        )));
    }

    #[test]
    fn test_degraded_mode_publishes_nothing() {
        let harness = harness();
        harness.sync.set_degraded(true);
        harness.sync.submit(
            StateDelta {
                current_position: Some(1.0),
                ..Default::default()
            },
            true,
        );
        assert_eq!(
            harness.sync.submit_and_wait(StateDelta {
                volume: Some(0.1),
                ..Default::default()
            }),
            Err(SyncError::NotInitialized("state record"))
        );
        thread::sleep(Duration::from_millis(60));
        assert!(harness.backend.state_writes().is_empty());
    }

    #[test]
    fn test_item_change_during_transition_is_published_once_with_its_queue() {
        let harness = harness();
        harness
            .sync
            .submit_and_wait(StateDelta {
                now_playing_video: Some(Some(item("a"))),
                active_queue: Some(queue(&["a", "b", "c"])),
                ..Default::default()
            })
            .expect("initial queue");

        let guard = harness.sync.begin_transition().expect("lock free");
        // Engine reports the new item before the queue catches up.
        harness.sync.submit(
            StateDelta {
                status: Some(PlaybackStatus::Playing),
                now_playing_video: Some(Some(item("b"))),
                current_position: Some(0.0),
                ..Default::default()
            },
            true,
        );
        harness.sync.submit(
            StateDelta {
                now_playing_video: Some(Some(item("b"))),
                active_queue: Some(queue(&["b", "c"])),
                priority_queue: Some(Vec::new()),
                ..Default::default()
            },
            true,
        );
        thread::sleep(Duration::from_millis(80));
        assert_eq!(harness.backend.state_writes().len(), 1);

        drop(guard);
        assert!(wait_until(Duration::from_secs(2), || {
            harness.backend.state_writes().len() >= 2
        }));
        thread::sleep(Duration::from_millis(80));
        let writes = harness.backend.state_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].now_playing_video, Some(Some(item("b"))));
        assert_eq!(writes[1].active_queue, Some(queue(&["b", "c"])));
        assert_eq!(writes[1].status, Some(PlaybackStatus::Playing));
        assert!(!harness.sync.has_pending());
    }

    #[test]
    fn test_cleared_item_during_transition_reaches_the_record() {
        let harness = harness();
        harness
            .sync
            .submit_and_wait(StateDelta {
                now_playing_video: Some(Some(item("a"))),
                active_queue: Some(queue(&["a"])),
                ..Default::default()
            })
            .expect("initial queue");

        let guard = harness.sync.begin_transition().expect("lock free");
        harness.sync.submit(
            StateDelta {
                now_playing_video: Some(None),
                active_queue: Some(Vec::new()),
                ..Default::default()
            },
            true,
        );
        drop(guard);
        assert!(wait_until(Duration::from_secs(2), || {
            harness
                .backend
                .fetch_state("node-1")
                .ok()
                .flatten()
                .map(|record| record.now_playing_video.is_none())
                .unwrap_or(false)
        }));
    }

    #[test]
    fn test_entry_buffered_while_flush_flag_is_held_is_not_stranded() {
        let harness = harness();
        harness.monitor.transition(ConnectionState::Disconnected);
        harness.sync.inner.flushing.store(true, Ordering::SeqCst);
        harness.sync.submit(
            StateDelta {
                active_queue: Some(queue(&["late"])),
                ..Default::default()
            },
            false,
        );
        harness.monitor.transition(ConnectionState::Connected);

        // Another flusher owns the flag, so this call backs off.
        harness.sync.flush_offline_buffer();
        assert_eq!(harness.sync.buffered_updates(), 1);

        // The owner releasing the flag must notice the new entry.
        assert!(harness.sync.inner.end_flush());
        harness.sync.flush_offline_buffer();
        assert_eq!(harness.sync.buffered_updates(), 0);
        assert_eq!(
            harness.backend.state_writes().last().and_then(|write| write.active_queue.clone()),
            Some(queue(&["late"]))
        );
        assert!(!harness.sync.inner.end_flush());
    }

    #[test]
    fn test_immediate_bursts_respect_minimum_write_spacing() {
        let harness = harness_spaced(10, 0, 60);
        for step in 0..3 {
            harness
                .sync
                .submit_and_wait(StateDelta {
                    current_position: Some(f64::from(step)),
                    ..Default::default()
                })
                .expect("write");
        }
        for step in 3..6 {
            harness.sync.submit(
                StateDelta {
                    current_position: Some(f64::from(step)),
                    ..Default::default()
                },
                true,
            );
            thread::sleep(Duration::from_millis(70));
        }
        assert!(wait_until(Duration::from_secs(2), || {
            harness
                .sync
                .last_synced()
                .map(|record| record.current_position == 5.0)
                .unwrap_or(false)
        }));

        let instants = harness.backend.write_instants();
        assert!(instants.len() >= 4, "got {} writes", instants.len());
        for pair in instants.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(50), "writes only {gap:?} apart");
        }
    }

    #[test]
    fn test_unseeded_write_takes_queue_from_backend_record() {
        let harness = harness();
        let mut record = StateRecord::new("node-1");
        record.active_queue = queue(&["a", "b"]);
        record.last_updated = 5;
        harness.backend.seed_record(record);

        harness
            .sync
            .submit_and_wait(StateDelta {
                current_position: Some(4.0),
                ..Default::default()
            })
            .expect("write");
        let writes = harness.backend.state_writes();
        assert_eq!(writes[0].active_queue, Some(queue(&["a", "b"])));
        assert_eq!(writes[0].priority_queue, Some(Vec::new()));
    }

    #[test]
    fn test_unseeded_write_sends_empty_queue_when_record_is_unreadable() {
        let harness = harness();
        harness.backend.set_state_fetch_failing(true);
        harness
            .sync
            .submit_and_wait(StateDelta {
                current_position: Some(4.0),
                ..Default::default()
            })
            .expect("write");
        let writes = harness.backend.state_writes();
        assert_eq!(writes[0].active_queue, Some(Vec::new()));
        assert_eq!(writes[0].priority_queue, Some(Vec::new()));
    }
}
