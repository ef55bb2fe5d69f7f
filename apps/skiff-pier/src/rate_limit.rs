use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window request limiter keyed by source address. Windows reset
/// lazily; the key map is pruned when it grows past `max_keys` so a
/// scan of spoofed sources cannot pin memory.
pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    max_keys: usize,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            max_requests,
            window,
            max_keys,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        if windows.len() > self.max_keys {
            windows.retain(|_, w| now.duration_since(w.started) < self.window);
            if windows.len() > self.max_keys {
                return false;
            }
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });
        if now.duration_since(window.started) >= self.window {
            window.count = 0;
            window.started = now;
        }
        window.count = window.count.saturating_add(1);
        window.count <= self.max_requests
    }
}
