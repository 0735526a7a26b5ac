//! # Log Rate Limiting
//!
//! A register that keeps failing to decode would otherwise log a warning on
//! every polling cycle. [`ThrottleManager`] keeps one [`LogThrottle`] per
//! category (register path, device label) so repeated failures are reported
//! a bounded number of times per window.
//!
//! ```rust
//! use modmeter_rs::util::logging::LogThrottle;
//!
//! let mut throttle = LogThrottle::new(60_000, 3);
//! if throttle.allow() {
//!     log::warn!("decode failed");
//! }
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// At most `cap` messages per window; the window restarts on the first message after it ends.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    cap: u32,
    count: u32,
    t0: Instant,
}

impl LogThrottle {
    /// Allow at most `cap` messages per `window_ms` milliseconds.
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            cap,
            count: 0,
            t0: Instant::now(),
        }
    }

    /// Returns `true` if the message should be logged.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit clock.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.t0) > self.window {
            self.t0 = now;
            self.count = 0;
        }

        self.count = self.count.saturating_add(1);
        self.count <= self.cap
    }

    /// Messages suppressed in the current window.
    pub fn suppressed(&self) -> u32 {
        self.count.saturating_sub(self.cap)
    }
}

/// Per-category throttles sharing one policy.
#[derive(Debug)]
pub struct ThrottleManager {
    window_ms: u64,
    cap: u32,
    throttles: HashMap<String, LogThrottle>,
}

impl ThrottleManager {
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            window_ms,
            cap,
            throttles: HashMap::new(),
        }
    }

    /// Whether a message for `category` may be logged now.
    pub fn allow(&mut self, category: &str) -> bool {
        let (window_ms, cap) = (self.window_ms, self.cap);
        self.throttles
            .entry(category.to_string())
            .or_insert_with(|| LogThrottle::new(window_ms, cap))
            .allow()
    }

    /// Drop the throttle for a category, e.g. once it decodes again.
    pub fn clear(&mut self, category: &str) {
        self.throttles.remove(category);
    }
}

impl Default for ThrottleManager {
    /// Three messages per category per minute.
    fn default() -> Self {
        Self::new(60_000, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_caps_within_window() {
        let mut throttle = LogThrottle::new(1000, 2);
        let now = Instant::now();
        assert!(throttle.allow_at(now));
        assert!(throttle.allow_at(now));
        assert!(!throttle.allow_at(now));
        assert_eq!(throttle.suppressed(), 1);
        assert!(throttle.allow_at(now + Duration::from_millis(1500)));
    }

    #[test]
    fn test_manager_categories_independent() {
        let mut manager = ThrottleManager::new(60_000, 1);
        assert!(manager.allow("/Ac/L1/Voltage"));
        assert!(!manager.allow("/Ac/L1/Voltage"));
        assert!(manager.allow("/Ac/L2/Voltage"));
        manager.clear("/Ac/L1/Voltage");
        assert!(manager.allow("/Ac/L1/Voltage"));
    }
}
