use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::warn;

/// Rolling-window request counter shared by every job in the process.
///
/// Once `threshold` requests fall inside `window`, the next caller sleeps
/// for `cooldown` and the window starts over. Other callers queue behind
/// the sleeping one.
#[derive(Debug)]
pub struct RateLimiter {
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// A `threshold` of zero disables limiting.
    pub fn new(threshold: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold,
            window,
            cooldown,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Register one request, sleeping first if the window is full.
    /// Returns true when a cooldown was taken.
    pub async fn acquire(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }

        let mut requests = self.requests.lock().await;
        let now = Instant::now();
        while requests
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            requests.pop_front();
        }

        let mut cooled = false;
        if requests.len() >= self.threshold {
            warn!(
                "{} translation requests in the last {:?}, cooling down for {:?}",
                requests.len(),
                self.window,
                self.cooldown
            );
            sleep(self.cooldown).await;
            requests.clear();
            cooled = true;
        }

        requests.push_back(Instant::now());
        cooled
    }

    /// Requests currently inside the window.
    pub async fn in_window(&self) -> usize {
        let requests = self.requests.lock().await;
        let now = Instant::now();
        requests
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_never_sleeps() {
        let limiter = RateLimiter::disabled();
        for _ in 0..100 {
            assert!(!limiter.acquire().await);
        }
    }

    #[tokio::test]
    async fn test_cooldown_after_threshold() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60), Duration::from_millis(20));

        assert!(!limiter.acquire().await);
        assert!(!limiter.acquire().await);
        assert!(!limiter.acquire().await);
        assert_eq!(limiter.in_window().await, 3);

        let started = std::time::Instant::now();
        assert!(limiter.acquire().await);
        assert!(started.elapsed() >= Duration::from_millis(20));
        // Window restarted with the request that waited.
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test]
    async fn test_old_requests_leave_the_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(20), Duration::from_secs(30));
        limiter.acquire().await;
        limiter.acquire().await;
        sleep(Duration::from_millis(30)).await;

        // Both earlier requests expired, so no 30s cooldown.
        assert!(!limiter.acquire().await);
    }
}
