use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,
    /// Initial delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 keeps the delay fixed)
    pub backoff_multiplier: f64,
    /// Sleep after a rate-limited response that carries no Retry-After
    pub rate_limit_delay: Duration,
    /// Rate-limit sleeps allowed per operation; they do not use up attempts
    pub max_rate_limit_waits: u32,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            rate_limit_delay: Duration::from_secs(10),
            max_rate_limit_waits: 5,
        }
    }

    /// Set the maximum delay between retries
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the rate-limit sleep and how many of them are free.
    ///
    /// The first `max_waits` rate-limited responses sleep without using an
    /// attempt. Past that, each one uses an attempt like any transient error,
    /// so a provider that keeps answering 429 still fails the operation
    /// once its attempts run out.
    pub fn with_rate_limit(mut self, delay: Duration, max_waits: u32) -> Self {
        self.rate_limit_delay = delay;
        self.max_rate_limit_waits = max_waits;
        self
    }

    /// Preset: translation batches (3 attempts, fixed 2s delay)
    pub fn batch_translation() -> Self {
        Self::new(3, Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(2))
            .with_backoff_multiplier(1.0)
            .with_rate_limit(Duration::from_secs(10), 5)
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::batch_translation()
    }
}

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Use up an attempt and try again after the configured delay.
    Retry,
    /// Sleep (this long, or the configured rate-limit delay) and try again
    /// without using up an attempt.
    Wait(Option<Duration>),
    /// Give up immediately.
    Abort,
}

/// Execute an async operation with retries, classifying each error.
///
/// `Retry` errors consume attempts, `Wait` errors sleep without consuming
/// one (at most `max_rate_limit_waits` times, after which they count as
/// `Retry`), `Abort` errors are returned at once.
///
/// # Panics
/// Panics if `config.max_attempts` is 0
pub async fn with_retry_policy<T, E, F, Fut, C>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    classify: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> RetryAction,
{
    assert!(
        config.max_attempts >= 1,
        "RetryConfig.max_attempts must be >= 1, got {}",
        config.max_attempts
    );

    let mut attempt: u32 = 0;
    let mut waits: u32 = 0;
    let mut pending_delay = Duration::ZERO;

    loop {
        if !pending_delay.is_zero() {
            debug!(
                "{}: Attempt {}/{} after {:?}",
                operation_name,
                attempt + 1,
                config.max_attempts,
                pending_delay
            );
            sleep(pending_delay).await;
        }

        let e = match operation().await {
            Ok(result) => {
                if attempt > 0 || waits > 0 {
                    debug!(
                        "{}: Succeeded on attempt {}/{} ({} rate-limit waits)",
                        operation_name,
                        attempt + 1,
                        config.max_attempts,
                        waits
                    );
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        match classify(&e) {
            RetryAction::Abort => {
                warn!("{}: Error is not retryable, failing immediately: {}", operation_name, e);
                return Err(e);
            }
            RetryAction::Wait(retry_after) if waits < config.max_rate_limit_waits => {
                waits += 1;
                pending_delay = retry_after.unwrap_or(config.rate_limit_delay);
                warn!(
                    "{}: Rate limited ({}), sleeping {:?} (wait {}/{})",
                    operation_name, e, pending_delay, waits, config.max_rate_limit_waits
                );
            }
            RetryAction::Wait(_) | RetryAction::Retry => {
                attempt += 1;
                let remaining = config.max_attempts.saturating_sub(attempt);
                if remaining == 0 {
                    warn!(
                        "{}: All {} attempts failed. Last error: {}",
                        operation_name, config.max_attempts, e
                    );
                    return Err(e);
                }
                warn!(
                    "{}: Attempt {}/{} failed ({}), {} retries remaining",
                    operation_name, attempt, config.max_attempts, e, remaining
                );
                pending_delay = config.delay_for_attempt(attempt);
            }
        }
    }
}
