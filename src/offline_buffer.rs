//! Bounded holding area for queue intent made while writes are not possible.

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;

use crate::backoff::Backoff;
use crate::config::OfflineConfig;
use crate::model::{content_eq, BufferedUpdate, QueueSnapshot};

/// Result of re-queueing an entry after a failed replay.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    RetryAfter(Duration),
    /// A newer entry arrived meanwhile; the failed one is dropped.
    Superseded,
    /// Attempts exhausted.
    Exhausted,
}

pub struct OfflineBuffer {
    entries: VecDeque<BufferedUpdate>,
    cap: usize,
    max_attempts: u32,
    retry: Backoff,
}

impl OfflineBuffer {
    pub fn new(config: &OfflineConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: config.buffer_cap.max(1),
            max_attempts: config.max_attempts.max(1),
            retry: Backoff::new(
                Duration::from_millis(config.retry_base_ms),
                Duration::from_millis(config.retry_max_ms),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&BufferedUpdate> {
        self.entries.back()
    }

    /// Appends `snapshot`, or refreshes the newest entry when its content is
    /// identical. The oldest entry is evicted past capacity.
    pub fn push(&mut self, snapshot: QueueSnapshot, timestamp: i64) -> usize {
        if let Some(newest) = self.entries.back_mut() {
            if content_eq(&newest.snapshot, &snapshot) {
                newest.timestamp = timestamp;
                newest.retry_count = 0;
                return self.entries.len();
            }
        }
        self.entries.push_back(BufferedUpdate {
            snapshot,
            timestamp,
            retry_count: 0,
        });
        while self.entries.len() > self.cap {
            self.entries.pop_front();
            debug!("OfflineBuffer: evicted oldest entry at capacity {}", self.cap);
        }
        self.entries.len()
    }

    /// Removes and returns the newest entry; older entries are superseded by
    /// it and discarded.
    pub fn take_latest(&mut self) -> Option<BufferedUpdate> {
        let latest = self.entries.pop_back();
        if !self.entries.is_empty() {
            debug!(
                "OfflineBuffer: {} older entries superseded",
                self.entries.len()
            );
            self.entries.clear();
        }
        latest
    }

    /// Records a failed replay of `update` and decides what happens next.
    pub fn requeue_failed(&mut self, mut update: BufferedUpdate) -> RetryDecision {
        update.retry_count = update.retry_count.saturating_add(1);
        if !self.entries.is_empty() {
            return RetryDecision::Superseded;
        }
        if update.retry_count >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        let delay = self.retry.delay_for_attempt(update.retry_count);
        self.entries.push_back(update);
        RetryDecision::RetryAfter(delay)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
