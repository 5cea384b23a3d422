//! Per-key de-duplication of app traffic.
//!
//! Several clients often send the same request at the same moment (every
//! screen asking for the current song when it changes). Only the first one
//! inside the window is forwarded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct Throttle {
    window: Duration,
    last_forwarded: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_forwarded: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` if a message with `key` may be forwarded at `now`, and
    /// records it. Check and record happen under one lock.
    pub fn check_and_set(&self, key: &str, now: Instant) -> bool {
        let mut last_forwarded = self.last_forwarded.lock();
        match last_forwarded.get(key) {
            Some(last) if now.saturating_duration_since(*last) < self.window => false,
            _ => {
                last_forwarded.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop entries older than the window. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut last_forwarded = self.last_forwarded.lock();
        let before = last_forwarded.len();
        last_forwarded.retain(|_, last| now.saturating_duration_since(*last) < self.window);
        before - last_forwarded.len()
    }

    pub fn len(&self) -> usize {
        self.last_forwarded.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
