//! Per-error-class log suppression.
//!
//! During long outages every sync attempt fails the same way; this keeps one
//! line per class per window instead of flooding the log.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use log::warn;

use crate::error::SyncError;

#[derive(Clone)]
pub struct LogThrottle {
    limiter: Arc<DefaultKeyedRateLimiter<&'static str>>,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        let window = window.max(Duration::from_millis(1));
        let quota = Quota::with_period(window)
            .expect("valid suppression window")
            .allow_burst(NonZeroU32::new(1).expect("non-zero burst"));
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Returns `true` when a line for `class` may be emitted now.
    pub fn allow(&self, class: &'static str) -> bool {
        self.limiter.check_key(&class).is_ok()
    }

    /// Logs `error` at warn level unless its class was logged recently.
    ///
    /// Cancellations and duplicates are expected outcomes and never logged.
    pub fn warn(&self, component: &str, action: &str, error: &SyncError) {
        if matches!(
            error,
            SyncError::Cancelled | SyncError::DuplicateCommand(_)
        ) {
            return;
        }
        if self.allow(error.class()) {
            warn!("{}: {} failed: {}", component, action, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LogThrottle;
    use std::time::Duration;

    #[test]
    fn test_allow_suppresses_repeats_within_window_per_class() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.allow("transient_network"));
        assert!(!throttle.allow("transient_network"));
        assert!(throttle.allow("schema_mismatch"));
    }

    #[test]
    fn test_allow_reopens_after_window() {
        let throttle = LogThrottle::new(Duration::from_millis(20));
        assert!(throttle.allow("timeout"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(throttle.allow("timeout"));
    }
}
