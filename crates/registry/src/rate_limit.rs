//! Sliding-window rate limiting keyed by an arbitrary string.
//!
//! Used for the per-instance-id register/deregister allowance and for the
//! per-api buckets keyed by raw URL path.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Keyed sliding-window limiter. A capacity of zero disables limiting.
#[derive(Debug)]
pub struct KeyedSlidingWindow {
    capacity: usize,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl KeyedSlidingWindow {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity as usize,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Records one event for `key`; returns false when the window is full.
    pub fn try_acquire(&self, key: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let now = Instant::now();
        let mut events = self.windows.entry(key.to_string()).or_default();
        while let Some(front) = events.front() {
            if now.duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        if events.len() >= self.capacity {
            return false;
        }
        events.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_capacity_per_key() {
        let limiter = KeyedSlidingWindow::new(2, Duration::from_secs(60));
        assert!(limiter.try_acquire("a"));
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        // Another key has its own window.
        assert!(limiter.try_acquire("b"));
    }

    #[test]
    fn zero_capacity_allows_everything() {
        let limiter = KeyedSlidingWindow::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert!(limiter.try_acquire("a"));
        }
    }

    #[test]
    fn window_expiry_frees_slots() {
        let limiter = KeyedSlidingWindow::new(1, Duration::from_millis(10));
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_acquire("a"));
    }
}
