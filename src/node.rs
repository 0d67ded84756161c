//! Node composition: wires the backend, synchronizer, command channel,
//! heartbeat, and playback clock onto one bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::TryRecvError, Receiver, Sender};

use crate::backends::SyncBackend;
use crate::backoff::Backoff;
use crate::command_channel::CommandChannel;
use crate::config::Config;
use crate::connection_monitor::ConnectionMonitor;
use crate::error::SyncError;
use crate::handlers::{register_default_handlers, HandlerContext, PlayQueue};
use crate::heartbeat::HeartbeatEmitter;
use crate::lock_or_recover;
use crate::log_throttle::LogThrottle;
use crate::model::{ConnectionState, PlaybackStatus, QueueSnapshot, StateDelta, StateRecord};
use crate::playback::{LocalPlayer, MediaCatalog, PlaybackEngine, PlaybackObserver};
use crate::protocol::{ConnectionMessage, Message, QueueMessage, SyncMessage};
use crate::state_sync::StateSynchronizer;

const REACTOR_TICK: Duration = Duration::from_millis(20);
const FEED_IDLE: Duration = Duration::from_millis(250);
const FEED_RETRY_BASE: Duration = Duration::from_millis(500);
const FEED_RETRY_MAX: Duration = Duration::from_secs(30);

/// Looks up (or creates) the node's record, giving up after `timeout`.
///
/// The lookup runs on its own thread so a hung backend cannot stall startup.
pub fn ensure_state_with_timeout(
    backend: Arc<dyn SyncBackend>,
    node_id: &str,
    timeout: Duration,
) -> Result<StateRecord, SyncError> {
    let (result_tx, result_rx) = mpsc::channel();
    let node_id = node_id.to_string();
    thread::spawn(move || {
        let _ = result_tx.send(backend.ensure_state(&node_id));
    });
    match result_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(timeout.as_millis() as u64)),
    }
}

/// One playback node and every background worker it owns.
pub struct SyncNode {
    node_id: String,
    backend: Arc<dyn SyncBackend>,
    bus_sender: Sender<Message>,
    startup_timeout: Duration,
    sync: Arc<StateSynchronizer>,
    channel: Arc<CommandChannel>,
    heartbeat: HeartbeatEmitter,
    queue: Arc<PlayQueue>,
    player: Arc<LocalPlayer>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncNode {
    pub fn new(
        config: &Config,
        backend: Arc<dyn SyncBackend>,
        catalog: Arc<dyn MediaCatalog>,
    ) -> Self {
        let node_id = config.node.node_id.clone();
        let (bus_sender, _) = broadcast::channel(1024);
        let throttle =
            LogThrottle::new(Duration::from_secs(config.logging.suppression_window_secs));
        let monitor = Arc::new(ConnectionMonitor::new(bus_sender.clone()));

        let sync = Arc::new(StateSynchronizer::new(
            &node_id,
            Arc::clone(&backend),
            Arc::clone(&monitor),
            bus_sender.clone(),
            &config.sync,
            &config.offline,
            throttle.clone(),
        ));
        let channel = Arc::new(CommandChannel::new(
            &node_id,
            Arc::clone(&backend),
            monitor,
            bus_sender.clone(),
            &config.commands,
            throttle.clone(),
        ));
        let heartbeat = HeartbeatEmitter::new(
            &node_id,
            Arc::clone(&backend),
            Duration::from_secs(config.heartbeat.interval_secs),
            throttle,
        );

        let player = Arc::new(LocalPlayer::new());
        player.set_observer(Arc::new(PlaybackObserver::new(Arc::clone(&sync))));
        let queue = Arc::new(PlayQueue::new());
        register_default_handlers(
            &channel,
            Arc::new(HandlerContext {
                engine: player.clone(),
                queue: Arc::clone(&queue),
                catalog,
                sync: Arc::clone(&sync),
            }),
        );

        Self {
            node_id,
            backend,
            bus_sender,
            startup_timeout: config.sync.startup_timeout(),
            sync,
            channel,
            heartbeat,
            queue,
            player,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn subscribe(&self) -> Receiver<Message> {
        self.bus_sender.subscribe()
    }

    pub fn sync(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn queue(&self) -> &Arc<PlayQueue> {
        &self.queue
    }

    pub fn player(&self) -> &Arc<LocalPlayer> {
        &self.player
    }

    /// Loads the node's record and starts every worker.
    ///
    /// When the record cannot be loaded in time the node keeps running
    /// degraded: commands still execute but nothing is published.
    pub fn start(&self) {
        let reactor_bus = self.bus_sender.subscribe();
        match ensure_state_with_timeout(
            Arc::clone(&self.backend),
            &self.node_id,
            self.startup_timeout,
        ) {
            Ok(record) => self.restore(record),
            Err(err) => {
                warn!(
                    "SyncNode: state record unavailable, running without sync: {}",
                    err
                );
                self.sync.set_degraded(true);
                let _ = self.bus_sender.send(Message::Sync(SyncMessage::Degraded {
                    reason: err.to_string(),
                }));
            }
        }

        let mut workers = lock_or_recover(&self.workers);
        let reactor = NodeReactor {
            bus_consumer: reactor_bus,
            sync: Arc::clone(&self.sync),
            channel: Arc::clone(&self.channel),
            queue: Arc::clone(&self.queue),
            player: Arc::clone(&self.player),
            stop: Arc::clone(&self.stop),
        };
        workers.push(thread::spawn(move || reactor.run()));

        if !self.sync.is_degraded() {
            let feed = StateFeed {
                node_id: self.node_id.clone(),
                backend: Arc::clone(&self.backend),
                sync: Arc::clone(&self.sync),
                stop: Arc::clone(&self.stop),
            };
            workers.push(thread::spawn(move || feed.run()));
        }
        drop(workers);

        self.channel.start();
        self.heartbeat.start();
        info!("SyncNode: {} started", self.node_id);
    }

    fn restore(&self, record: StateRecord) {
        info!(
            "SyncNode: restored state for {} ({} queued, {} priority)",
            self.node_id,
            record.active_queue.len(),
            record.priority_queue.len()
        );
        let _ = self.player.set_volume(record.volume);
        self.queue.replace(QueueSnapshot {
            now_playing: None,
            active_queue: record.active_queue.clone(),
            priority_queue: record.priority_queue.clone(),
        });
        self.sync.seed(record);
        self.sync.submit(
            StateDelta {
                status: Some(PlaybackStatus::Idle),
                now_playing_video: Some(None),
                current_position: Some(0.0),
                is_online: Some(true),
                ..Default::default()
            },
            true,
        );
    }

    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heartbeat.stop();
        self.channel.shutdown();
        let workers: Vec<JoinHandle<()>> = lock_or_recover(&self.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("SyncNode: worker thread panicked");
            }
        }
        self.sync.shutdown();
        info!("SyncNode: {} stopped", self.node_id);
    }
}

impl Drop for SyncNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reacts to bus traffic and drives the local playback clock.
struct NodeReactor {
    bus_consumer: Receiver<Message>,
    sync: Arc<StateSynchronizer>,
    channel: Arc<CommandChannel>,
    queue: Arc<PlayQueue>,
    player: Arc<LocalPlayer>,
    stop: Arc<AtomicBool>,
}

impl NodeReactor {
    fn handle_message(&self, message: Message) {
        match message {
            Message::Connection(ConnectionMessage::StateChanged {
                previous,
                current: ConnectionState::Connected,
            }) if previous != ConnectionState::Connected => {
                self.channel.reset_backoff();
                let sync = Arc::clone(&self.sync);
                let channel = Arc::clone(&self.channel);
                // Offline replay may sleep through retry backoff.
                thread::spawn(move || {
                    sync.on_connected();
                    channel.flush_inbound();
                });
            }
            Message::Queue(QueueMessage::RemoteQueueApplied {
                now_playing,
                active_queue,
                priority_queue,
            }) => {
                self.queue.replace(QueueSnapshot {
                    now_playing,
                    active_queue,
                    priority_queue,
                });
            }
            _ => {}
        }
    }

    /// Drains the bus; `true` once the bus is closed.
    fn process_pending_bus_messages(&mut self) -> bool {
        loop {
            match self.bus_consumer.try_recv() {
                Ok(message) => self.handle_message(message),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("SyncNode: bus lagged by {} messages", skipped);
                }
                Err(TryRecvError::Closed) => return true,
            }
        }
    }

    fn advance_playback(&self, elapsed: Duration) {
        if !self.player.advance(elapsed.as_secs_f64()) {
            return;
        }
        let _transition = self.sync.begin_transition();
        let next = self.queue.advance();
        match next.as_ref() {
            Some(item) => {
                debug!("SyncNode: advancing to {}", item.identity());
                if let Err(err) = self.player.play(item) {
                    warn!("SyncNode: could not start {}: {}", item.identity(), err);
                }
            }
            None => {
                let _ = self.player.skip();
            }
        }
        self.queue.publish(&self.sync);
    }

    fn run(mut self) {
        let mut last_tick = Instant::now();
        while !self.stop.load(Ordering::SeqCst) {
            if self.process_pending_bus_messages() {
                break;
            }
            let now = Instant::now();
            self.advance_playback(now.duration_since(last_tick));
            last_tick = now;
            thread::sleep(REACTOR_TICK);
        }
    }
}

/// Feeds remote changes to the node's record into the synchronizer.
struct StateFeed {
    node_id: String,
    backend: Arc<dyn SyncBackend>,
    sync: Arc<StateSynchronizer>,
    stop: Arc<AtomicBool>,
}

impl StateFeed {
    fn run(self) {
        let mut retry = Backoff::new(FEED_RETRY_BASE, FEED_RETRY_MAX);
        while !self.stop.load(Ordering::SeqCst) {
            let changes = match self.backend.subscribe_state(&self.node_id) {
                Ok(changes) => changes,
                Err(err) => {
                    debug!("SyncNode: state feed subscribe failed: {}", err);
                    self.sleep(retry.current());
                    retry.next();
                    continue;
                }
            };
            retry.reset();
            loop {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                match changes.recv_timeout(FEED_IDLE) {
                    Ok(change) if change.origin == self.node_id => {}
                    Ok(change) => {
                        self.sync.apply_remote_update(change);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("SyncNode: state feed closed, resubscribing");
                        break;
                    }
                }
            }
        }
    }

    fn sleep(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline && !self.stop.load(Ordering::SeqCst) {
            thread::sleep(REACTOR_TICK);
        }
    }
}
