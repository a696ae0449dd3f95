//! Translation counters exposed on the status API.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide translation counters, shared through an `Arc`.
#[derive(Debug, Default)]
pub struct TranslationMetrics {
    /// Number of API calls made to the translation service
    api_calls: AtomicUsize,

    /// Number of API calls that failed (any reason)
    api_failures: AtomicUsize,

    /// Number of 429 responses
    rate_limited: AtomicUsize,

    /// Number of cooldowns forced by the rolling rate limiter
    cooldowns: AtomicUsize,

    /// Items whose missing languages were written
    items_translated: AtomicUsize,

    /// Batches that exhausted their retries
    batches_failed: AtomicUsize,

    jobs_completed: AtomicUsize,
    jobs_failed: AtomicUsize,
}

impl TranslationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_api_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_api_failure(&self) {
        self.api_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cooldown(&self) {
        self.cooldowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_items_translated(&self, count: usize) {
        self.items_translated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn api_calls(&self) -> usize {
        self.api_calls.load(Ordering::Relaxed)
    }

    pub fn api_failures(&self) -> usize {
        self.api_failures.load(Ordering::Relaxed)
    }

    /// Generate a metrics report.
    pub fn report(&self) -> MetricsReport {
        let calls = self.api_calls();
        let failures = self.api_failures();
        let api_success_rate = if calls > 0 {
            (calls.saturating_sub(failures) as f64 / calls as f64) * 100.0
        } else {
            0.0
        };

        MetricsReport {
            api_calls: calls,
            api_failures: failures,
            api_success_rate,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            cooldowns: self.cooldowns.load(Ordering::Relaxed),
            items_translated: self.items_translated.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

/// Metrics report containing current translation statistics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsReport {
    pub api_calls: usize,
    pub api_failures: usize,

    /// API success rate as a percentage (0-100)
    pub api_success_rate: f64,

    pub rate_limited: usize,
    pub cooldowns: usize,
    pub items_translated: usize,
    pub batches_failed: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
}
