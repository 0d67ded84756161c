//! Periodic liveness signal for the node's shared record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backends::SyncBackend;
use crate::error::SyncError;
use crate::lock_or_recover;
use crate::log_throttle::LogThrottle;
use crate::model::now_unix_ms;

const STOP_POLL: Duration = Duration::from_millis(50);

/// Which path a heartbeat tick went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPath {
    Rpc,
    FieldUpdate,
}

pub struct HeartbeatEmitter {
    node_id: String,
    backend: Arc<dyn SyncBackend>,
    interval: Duration,
    throttle: LogThrottle,
    rpc_supported: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatEmitter {
    pub fn new(
        node_id: &str,
        backend: Arc<dyn SyncBackend>,
        interval: Duration,
        throttle: LogThrottle,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            backend,
            interval,
            throttle,
            rpc_supported: Arc::new(AtomicBool::new(true)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Sends one heartbeat, falling back to a direct field update when the
    /// backend has no liveness RPC. Once the RPC is found missing it is not
    /// tried again.
    pub fn beat(&self) -> Result<HeartbeatPath, SyncError> {
        beat_once(
            &self.node_id,
            self.backend.as_ref(),
            &self.rpc_supported,
            now_unix_ms(),
        )
    }

    pub fn start(&self) {
        let mut worker = lock_or_recover(&self.worker);
        if worker.is_some() {
            return;
        }
        let node_id = self.node_id.clone();
        let backend = Arc::clone(&self.backend);
        let rpc_supported = Arc::clone(&self.rpc_supported);
        let stop = Arc::clone(&self.stop);
        let throttle = self.throttle.clone();
        let interval = self.interval;
        info!(
            "HeartbeatEmitter: started for {} every {:?}",
            node_id, interval
        );
        *worker = Some(thread::spawn(move || {
            let mut next_beat = Instant::now();
            while !stop.load(Ordering::SeqCst) {
                if Instant::now() >= next_beat {
                    match beat_once(&node_id, backend.as_ref(), &rpc_supported, now_unix_ms()) {
                        Ok(path) => debug!("HeartbeatEmitter: beat via {:?}", path),
                        Err(err) => throttle.warn("HeartbeatEmitter", "heartbeat", &err),
                    }
                    next_beat = Instant::now() + interval;
                }
                thread::sleep(STOP_POLL.min(interval));
            }
        }));
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let worker = lock_or_recover(&self.worker).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("HeartbeatEmitter: worker thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn beat_once(
    node_id: &str,
    backend: &dyn SyncBackend,
    rpc_supported: &AtomicBool,
    at_ms: i64,
) -> Result<HeartbeatPath, SyncError> {
    if rpc_supported.load(Ordering::SeqCst) {
        match backend.heartbeat(node_id, at_ms) {
            Ok(()) => return Ok(HeartbeatPath::Rpc),
            Err(SyncError::Unsupported(reason)) => {
                info!(
                    "HeartbeatEmitter: liveness rpc unavailable ({}), using field updates",
                    reason
                );
                rpc_supported.store(false, Ordering::SeqCst);
            }
            Err(err) => return Err(err),
        }
    }
    backend.touch_heartbeat(node_id, at_ms)?;
    Ok(HeartbeatPath::FieldUpdate)
}

#[cfg(test)]
mod tests {
    use super::{HeartbeatEmitter, HeartbeatPath};
    use crate::backends::memory::MemoryBackend;
    use crate::backends::SyncBackend;
    use crate::log_throttle::LogThrottle;
    use std::sync::Arc;
    use std::time::Duration;

    fn emitter(backend: Arc<MemoryBackend>, interval: Duration) -> HeartbeatEmitter {
        HeartbeatEmitter::new(
            "node-1",
            backend,
            interval,
            LogThrottle::new(Duration::from_secs(30)),
        )
    }

    #[test]
    fn test_beat_prefers_rpc() {
        let backend = Arc::new(MemoryBackend::new());
        backend.ensure_state("node-1").expect("ensure");
        let emitter = emitter(backend.clone(), Duration::from_secs(20));
        assert_eq!(emitter.beat(), Ok(HeartbeatPath::Rpc));
        let record = backend
            .fetch_state("node-1")
            .expect("fetch")
            .expect("record");
        assert!(record.is_online);
        assert!(record.last_heartbeat > 0);
    }

    #[test]
    fn test_missing_rpc_falls_back_to_field_update_and_sticks() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_liveness_rpc_supported(false);
        let emitter = emitter(backend.clone(), Duration::from_secs(20));
        assert_eq!(emitter.beat(), Ok(HeartbeatPath::FieldUpdate));

        backend.set_liveness_rpc_supported(true);
        assert_eq!(emitter.beat(), Ok(HeartbeatPath::FieldUpdate));
        let beats = backend.heartbeats();
        assert_eq!(beats.len(), 2);
        assert!(beats.iter().all(|(path, _)| path.starts_with("field:")));
    }

    #[test]
    fn test_failures_are_returned_not_fatal() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let emitter = emitter(backend.clone(), Duration::from_millis(20));
        assert!(emitter.beat().is_err());

        emitter.start();
        std::thread::sleep(Duration::from_millis(60));
        backend.set_available(true);
        std::thread::sleep(Duration::from_millis(120));
        emitter.stop();
        assert!(!backend.heartbeats().is_empty());
    }

    #[test]
    fn test_worker_ticks_on_interval() {
        let backend = Arc::new(MemoryBackend::new());
        let emitter = emitter(backend.clone(), Duration::from_millis(30));
        emitter.start();
        std::thread::sleep(Duration::from_millis(200));
        emitter.stop();
        let count = backend.heartbeats().len();
        assert!(count >= 3, "expected several beats, got {count}");
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(backend.heartbeats().len(), count);
    }
}
