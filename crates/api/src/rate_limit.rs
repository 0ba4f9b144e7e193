use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sliding-window limiter keyed by client IP (or `auth:{path}:{ip}`).
#[derive(Debug, Clone)]
pub struct IpRateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    max_requests: usize,
}

impl IpRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_requests,
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut guard = self.inner.lock();
        let queue = guard.entry(key.to_string()).or_default();

        while let Some(front) = queue.front() {
            if now.duration_since(*front) > self.window {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.max_requests {
            return false;
        }

        queue.push_back(now);
        true
    }

    /// Drops keys whose whole window has elapsed. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let before = guard.len();
        guard.retain(|_, queue| {
            queue
                .back()
                .is_some_and(|last| now.duration_since(*last) <= self.window)
        });
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_max_requests_within_window() {
        let limiter = IpRateLimiter::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        assert!(limiter.allow_at("10.0.0.1", now));
        assert!(limiter.allow_at("10.0.0.1", now));
        assert!(!limiter.allow_at("10.0.0.1", now));
        assert!(limiter.allow_at("10.0.0.2", now));
    }

    #[test]
    fn window_slides_forward() {
        let limiter = IpRateLimiter::new(Duration::from_millis(50), 1);
        let start = Instant::now();
        assert!(limiter.allow_at("ip", start));
        assert!(!limiter.allow_at("ip", start + Duration::from_millis(10)));
        assert!(limiter.allow_at("ip", start + Duration::from_millis(61)));
    }

    #[test]
    fn prune_keeps_active_keys() {
        let limiter = IpRateLimiter::new(Duration::from_secs(60), 5);
        assert!(limiter.allow("active"));
        assert_eq!(limiter.prune(), 0);
    }
}
