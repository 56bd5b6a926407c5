use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{event, Level};

#[derive(Debug)]
struct UserWindow {
    count: u64,
    window_start: Instant,
    last_seen: Instant,
}

/// Per-user fixed-window rate limiter. Denial never surfaces as an error:
/// the caller serves its default value and the stats tracker counts the
/// blocked evaluation.
///
/// Tracked-user state is bounded; when the map is full the oldest-idle
/// entry is evicted under the same lock that guards the map.
pub struct RateLimiter {
    max_requests: u64,
    window: Duration,
    max_tracked_users: usize,
    windows: Mutex<HashMap<String, UserWindow>>,
}

impl RateLimiter {
    pub const DEFAULT_MAX_REQUESTS: u64 = 1000;
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

    pub fn new(max_requests: u64, window: Duration, max_tracked_users: usize) -> Self {
        Self {
            max_requests,
            window,
            max_tracked_users: max_tracked_users.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this user may evaluate now. Counts the request against the
    /// user's current window either way the window rolls.
    pub fn allow(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("limiter lock should not be poisoned");

        if !windows.contains_key(user_id) && windows.len() >= self.max_tracked_users {
            Self::evict_oldest_idle(&mut windows);
        }

        let entry = windows.entry(user_id.to_string()).or_insert(UserWindow {
            count: 0,
            window_start: now,
            last_seen: now,
        });
        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.last_seen = now;
        if entry.count >= self.max_requests {
            event!(Level::WARN, "rate limit exceeded for user {}", user_id);
            return false;
        }
        entry.count += 1;
        true
    }

    pub fn tracked_users(&self) -> usize {
        self.windows
            .lock()
            .expect("limiter lock should not be poisoned")
            .len()
    }

    fn evict_oldest_idle(windows: &mut HashMap<String, UserWindow>) {
        let oldest = windows
            .iter()
            .min_by_key(|(_, w)| w.last_seen)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            windows.remove(&key);
        }
    }
}
