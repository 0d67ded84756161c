//! At-most-once delivery and execution of operator commands.
//!
//! Commands arrive over the node-scoped pub/sub subscription. While that
//! subscription is unhealthy, the durable command log is polled instead with
//! exponential backoff. Both transports feed `deliver()`, which dedups by
//! command id before anything runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast::Sender;

use crate::backends::{ChannelEvent, SyncBackend};
use crate::backoff::Backoff;
use crate::config::CommandsConfig;
use crate::connection_monitor::{ConnectionMonitor, LifecycleEvent};
use crate::error::SyncError;
use crate::lock_or_recover;
use crate::log_throttle::LogThrottle;
use crate::model::{
    now_unix_ms, Command, CommandEnvelope, CommandStatus, CommandType, ExecutionRecord,
};
use crate::protocol::{CommandMessage, Message};

const IDLE_TICK: Duration = Duration::from_millis(250);

/// Executes one command type against the local node.
///
/// `Ok` carries optional result data for the operator; `Err` carries the
/// failure message written into the execution result.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Command) -> Result<Option<Value>, String>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Command) -> Result<Option<Value>, String> + Send + Sync,
{
    fn handle(&self, command: &Command) -> Result<Option<Value>, String> {
        self(command)
    }
}

/// Which transport handed a command to `deliver()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    PubSub,
    Poll,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Executed { success: bool },
    Duplicate,
    Expired,
    WrongTarget,
    /// Held until the connection returns.
    Queued,
}

/// Bounded insertion-ordered id set.
struct ProcessedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    cap: usize,
    trim_to: usize,
}

impl ProcessedIds {
    fn new(cap: usize, trim_to: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            cap: cap.max(1),
            trim_to: trim_to.min(cap.saturating_sub(1)),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > self.cap {
            while self.order.len() > self.trim_to {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Dedup {
    processed: ProcessedIds,
    executing: HashSet<String>,
}

impl Dedup {
    fn is_known(&self, id: &str) -> bool {
        self.processed.contains(id) || self.executing.contains(id)
    }

    /// Marks `id` processed and executing; `false` if it was already seen.
    fn claim(&mut self, id: &str) -> bool {
        if self.is_known(id) {
            return false;
        }
        self.processed.insert(id);
        self.executing.insert(id.to_string());
        true
    }

    fn finish(&mut self, id: &str) {
        self.executing.remove(id);
    }
}

struct ChannelInner {
    node_id: String,
    backend: Arc<dyn SyncBackend>,
    monitor: Arc<ConnectionMonitor>,
    bus_producer: Sender<Message>,
    throttle: LogThrottle,
    ttl_ms: i64,
    inbound_cap: usize,
    handlers: RwLock<HashMap<CommandType, Arc<dyn CommandHandler>>>,
    dedup: Mutex<Dedup>,
    inbound: Mutex<VecDeque<Command>>,
    poll_backoff: Mutex<Backoff>,
    pubsub_healthy: AtomicBool,
    stop: AtomicBool,
}

/// Receives, dedups and executes commands addressed to this node.
pub struct CommandChannel {
    inner: Arc<ChannelInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandChannel {
    pub fn new(
        node_id: &str,
        backend: Arc<dyn SyncBackend>,
        monitor: Arc<ConnectionMonitor>,
        bus_producer: Sender<Message>,
        config: &CommandsConfig,
        throttle: LogThrottle,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                node_id: node_id.to_string(),
                backend,
                monitor,
                bus_producer,
                throttle,
                ttl_ms: config.command_ttl_ms(),
                inbound_cap: config.inbound_queue_cap.max(1),
                handlers: RwLock::new(HashMap::new()),
                dedup: Mutex::new(Dedup {
                    processed: ProcessedIds::new(
                        config.processed_id_cap,
                        config.processed_id_trim,
                    ),
                    executing: HashSet::new(),
                }),
                inbound: Mutex::new(VecDeque::new()),
                poll_backoff: Mutex::new(Backoff::new(
                    Duration::from_millis(config.poll_base_ms),
                    Duration::from_millis(config.poll_max_ms),
                )),
                pubsub_healthy: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Registers `handler` for `command_type`. The first registration wins;
    /// later ones are ignored and reported with `false`.
    pub fn register_handler(
        &self,
        command_type: CommandType,
        handler: Arc<dyn CommandHandler>,
    ) -> bool {
        let mut handlers = match self.inner.handlers.write() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handlers.contains_key(&command_type) {
            warn!("CommandChannel: handler for {} already registered, ignoring", command_type);
            return false;
        }
        handlers.insert(command_type, handler);
        true
    }

    /// Subscribes to the node's channel and starts the receive/poll loop.
    pub fn start(&self) {
        let mut worker = lock_or_recover(&self.worker);
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(thread::spawn(move || inner.run()));
    }

    pub fn deliver(&self, command: Command, transport: Transport) -> Delivery {
        self.inner.deliver(command, transport)
    }

    /// Executes commands held while disconnected, in arrival order.
    pub fn flush_inbound(&self) -> usize {
        self.inner.flush_inbound()
    }

    pub fn inbound_len(&self) -> usize {
        lock_or_recover(&self.inner.inbound).len()
    }

    pub fn reset_backoff(&self) {
        lock_or_recover(&self.inner.poll_backoff).reset();
    }

    pub fn poll_delay(&self) -> Duration {
        lock_or_recover(&self.inner.poll_backoff).current()
    }

    /// One poll of the command log, with backoff bookkeeping. Returns the
    /// delay before the next poll.
    pub fn poll_with_backoff(&self) -> Duration {
        self.inner.poll_with_backoff()
    }

    pub fn is_pubsub_healthy(&self) -> bool {
        self.inner.pubsub_healthy.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        let worker = lock_or_recover(&self.worker).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("CommandChannel: worker thread panicked");
            }
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ChannelInner {
    fn emit(&self, message: CommandMessage) {
        let _ = self.bus_producer.send(Message::Command(message));
    }

    fn deliver(&self, command: Command, transport: Transport) -> Delivery {
        if lock_or_recover(&self.dedup).is_known(&command.id) {
            debug!("CommandChannel: ignoring duplicate {}", command.id);
            return Delivery::Duplicate;
        }

        // A successful poll proves the log is reachable; only pub/sub
        // deliveries are held while the connection is down.
        if transport == Transport::PubSub && !self.monitor.is_connected() {
            return self.enqueue(command);
        }
        self.process(command)
    }

    fn enqueue(&self, command: Command) -> Delivery {
        let mut inbound = lock_or_recover(&self.inbound);
        if inbound.iter().any(|queued| queued.id == command.id) {
            return Delivery::Duplicate;
        }
        if inbound.len() >= self.inbound_cap {
            if let Some(dropped) = inbound.pop_front() {
                warn!(
                    "CommandChannel: inbound queue full, dropping oldest command {}",
                    dropped.id
                );
            }
        }
        let id = command.id.clone();
        inbound.push_back(command);
        let pending = inbound.len();
        drop(inbound);
        debug!("CommandChannel: queued {} while disconnected", id);
        self.emit(CommandMessage::Queued { id, pending });
        Delivery::Queued
    }

    fn flush_inbound(&self) -> usize {
        let mut flushed = 0;
        while self.monitor.is_connected() {
            let Some(command) = lock_or_recover(&self.inbound).pop_front() else {
                break;
            };
            self.process(command);
            flushed += 1;
        }
        if flushed > 0 {
            info!("CommandChannel: flushed {} queued commands", flushed);
        }
        flushed
    }

    fn process(&self, command: Command) -> Delivery {
        if !lock_or_recover(&self.dedup).claim(&command.id) {
            debug!("CommandChannel: ignoring duplicate {}", command.id);
            return Delivery::Duplicate;
        }

        let now = now_unix_ms();
        let outcome = if command.is_expired(now, self.ttl_ms) {
            debug!(
                "CommandChannel: {} expired ({} ms old)",
                command.id,
                now - command.issued_at
            );
            self.write_back(&command.id, &ExecutionRecord::expired(now));
            self.emit(CommandMessage::Skipped {
                id: command.id.clone(),
                reason: "expired".to_string(),
            });
            Delivery::Expired
        } else if command.target_node_id != self.node_id {
            warn!(
                "CommandChannel: {} targets {}, not {}",
                command.id, command.target_node_id, self.node_id
            );
            self.write_back(&command.id, &ExecutionRecord::skipped_wrong_target(now));
            self.emit(CommandMessage::Skipped {
                id: command.id.clone(),
                reason: "wrong target".to_string(),
            });
            Delivery::WrongTarget
        } else {
            let record = self.execute(&command);
            let success = record.status == CommandStatus::Completed;
            self.write_back(&command.id, &record);
            self.emit(CommandMessage::Executed {
                id: command.id.clone(),
                command_type: command.command_type,
                success,
            });
            Delivery::Executed { success }
        };

        lock_or_recover(&self.dedup).finish(&command.id);
        outcome
    }

    fn execute(&self, command: &Command) -> ExecutionRecord {
        let handler = match self.handlers.read() {
            Ok(handlers) => handlers.get(&command.command_type).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&command.command_type).cloned(),
        };
        let Some(handler) = handler else {
            warn!("CommandChannel: no handler registered for {}", command.command_type);
            return ExecutionRecord::failed(
                format!("no handler for {}", command.command_type),
                now_unix_ms(),
            );
        };
        match handler.handle(command) {
            Ok(data) => {
                info!(
                    "CommandChannel: executed {} ({}) from {}",
                    command.command_type,
                    command.id,
                    command.issuer
                );
                ExecutionRecord::completed(data, now_unix_ms())
            }
            Err(message) => {
                warn!(
                    "CommandChannel: {} ({}) failed: {}",
                    command.command_type,
                    command.id,
                    message
                );
                ExecutionRecord::failed(message, now_unix_ms())
            }
        }
    }

    fn write_back(&self, command_id: &str, record: &ExecutionRecord) {
        match self.backend.update_command_status(command_id, record) {
            Ok(()) => {}
            Err(SyncError::SchemaMismatch(reason)) => {
                debug!(
                    "CommandChannel: retrying status write for {} without result fields: {}",
                    command_id, reason
                );
                if let Err(err) = self
                    .backend
                    .update_command_status(command_id, &record.reduced())
                {
                    self.throttle.warn("CommandChannel", "status write-back", &err);
                }
            }
            Err(err) => self.throttle.warn("CommandChannel", "status write-back", &err),
        }
    }

    fn poll_once(&self) -> Result<usize, SyncError> {
        let since = now_unix_ms().saturating_sub(self.ttl_ms);
        let commands = self.backend.fetch_pending_commands(&self.node_id, since)?;
        let mut executed = 0;
        for command in commands {
            if let Delivery::Executed { .. } = self.deliver(command, Transport::Poll) {
                executed += 1;
            }
        }
        Ok(executed)
    }

    fn poll_with_backoff(&self) -> Duration {
        let result = self.poll_once();
        let mut backoff = lock_or_recover(&self.poll_backoff);
        match result {
            Ok(executed) => {
                if executed > 0 {
                    debug!("CommandChannel: poll executed {} commands", executed);
                }
                backoff.reset();
            }
            Err(err) => {
                self.throttle.warn("CommandChannel", "command poll", &err);
                backoff.next();
            }
        }
        backoff.current()
    }

    fn subscribe(&self) -> Option<Receiver<ChannelEvent>> {
        match self.backend.subscribe_commands(&self.node_id) {
            Ok(events) => Some(events),
            Err(err) => {
                self.throttle.warn("CommandChannel", "subscribe", &err);
                None
            }
        }
    }

    fn mark_unhealthy(&self) {
        self.pubsub_healthy.store(false, Ordering::SeqCst);
    }

    fn run(&self) {
        let mut events = self.subscribe();
        // Catch up on anything issued while this node was offline.
        let mut next_poll = Some(Instant::now() + self.poll_with_backoff());

        while !self.stop.load(Ordering::SeqCst) {
            let wait = next_poll
                .map(|at| at.saturating_duration_since(Instant::now()).min(IDLE_TICK))
                .unwrap_or(IDLE_TICK);

            match events.as_ref().map(|rx| rx.recv_timeout(wait)) {
                Some(Ok(ChannelEvent::Lifecycle(event))) => {
                    self.monitor.handle_lifecycle(event);
                    if event == LifecycleEvent::Subscribed {
                        self.pubsub_healthy.store(true, Ordering::SeqCst);
                        lock_or_recover(&self.poll_backoff).reset();
                        next_poll = None;
                    } else {
                        self.mark_unhealthy();
                        if event == LifecycleEvent::Closed {
                            events = None;
                        }
                        next_poll.get_or_insert_with(Instant::now);
                    }
                }
                Some(Ok(ChannelEvent::Envelope(CommandEnvelope { command, .. }))) => {
                    lock_or_recover(&self.poll_backoff).reset();
                    self.deliver(command, Transport::PubSub);
                }
                Some(Err(RecvTimeoutError::Timeout)) => {}
                Some(Err(RecvTimeoutError::Disconnected)) => {
                    self.monitor.handle_lifecycle(LifecycleEvent::Closed);
                    self.mark_unhealthy();
                    events = None;
                    next_poll.get_or_insert_with(Instant::now);
                }
                None => thread::sleep(wait),
            }

            if self.pubsub_healthy.load(Ordering::SeqCst) {
                continue;
            }
            let due = next_poll.map(|at| at <= Instant::now()).unwrap_or(true);
            if due {
                let delay = self.poll_with_backoff();
                if events.is_none() {
                    events = self.subscribe();
                }
                next_poll = Some(Instant::now() + delay);
            }
        }
    }
}

/// Issuer side: writes commands into the durable log and announces them.
pub struct CommandIssuer {
    backend: Arc<dyn SyncBackend>,
    issuer: String,
}

impl CommandIssuer {
    pub fn new(backend: Arc<dyn SyncBackend>, issuer: &str) -> Self {
        Self {
            backend,
            issuer: issuer.to_string(),
        }
    }

    /// Accepted once the durable insert succeeds; the publish is best-effort
    /// and a missed one is picked up by the target's poll fallback.
    pub fn send(
        &self,
        target_node_id: &str,
        command_type: CommandType,
        payload: Value,
    ) -> Result<Command, SyncError> {
        let now = now_unix_ms();
        let command = Command::new(target_node_id, command_type, payload, &self.issuer, now);
        self.backend.insert_command(&command)?;
        let envelope = CommandEnvelope {
            command: command.clone(),
            timestamp: now,
        };
        if let Err(err) = self.backend.publish_command(&envelope) {
            warn!(
                "CommandIssuer: publish of {} failed, relying on poll: {}",
                command.id, err
            );
        }
        Ok(command)
    }

    /// Current log entry for `command_id`, including any execution result.
    pub fn status(&self, command_id: &str) -> Result<Option<Command>, SyncError> {
        self.backend.fetch_command(command_id)
    }
}
