use crate::extractor::ExtractContext;
use crate::orchestrator::{OrchestratorConfig, RateLimiter};
use crate::retry::RetryConfig;
use crate::scan::ScanConfig;
use crate::translation::TranslatorConfig;
use anyhow::{bail, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_path: String,
    pub content_database_path: String,
    pub registry_file: String,

    // Translation API
    pub openai_api_key: Option<String>,
    pub openai_api_url: String,
    pub openai_model: String,
    pub request_timeout_secs: u64,
    pub target_languages: Vec<String>,

    // Languages
    pub site_language: String,
    pub interface_language: String,

    // Tagging pass
    pub extract_multilang: bool,
    pub scan_budget: usize,
    pub scan_page_size: usize,
    pub purge_batch_size: usize,

    // Batching
    pub batch_max_items: usize,
    pub batch_max_chars: usize,
    pub job_time_budget_secs: u64,

    // Retry
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub rate_limit_delay_ms: u64,
    pub max_rate_limit_waits: u32,

    // Global rate limiter
    pub rate_limit_threshold: usize,
    pub rate_limit_window_secs: u64,
    pub rate_limit_cooldown_secs: u64,

    // Server
    pub api_key: Option<String>,
    pub port: u16,

    // Schedules (6-field cron, UTC)
    pub tagging_schedule: String,
    pub purge_schedule: String,
    pub queue_poll_schedule: String,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name).ok().map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

/// Split `es, FR ,pt-br` into normalized codes: `["es", "fr", "pt_br"]`.
pub fn parse_languages(value: &str) -> Vec<String> {
    let mut langs: Vec<String> = value
        .split(',')
        .map(|l| l.trim().to_lowercase().replace('-', "_"))
        .filter(|l| !l.is_empty())
        .collect();
    langs.sort();
    langs.dedup();
    langs
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            // Storage
            database_path: env_or("DATABASE_PATH", "tagsync.db"),
            content_database_path: env_or("CONTENT_DATABASE_PATH", "content.db"),
            registry_file: env_or("REGISTRY_FILE", "registry.json"),

            // Translation API - key is optional so tagging can run without it
            openai_api_key: env_optional("OPENAI_API_KEY"),
            openai_api_url: env_or("OPENAI_API_URL", "https://api.openai.com/v1"),
            openai_model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", 60),
            target_languages: parse_languages(&env_or("TARGET_LANGUAGES", "")),

            // Languages
            site_language: env_or("SITE_LANGUAGE", "en").to_lowercase(),
            interface_language: env_or("INTERFACE_LANGUAGE", "en").to_lowercase(),

            // Tagging pass
            extract_multilang: env_bool("EXTRACT_MULTILANG", true),
            scan_budget: env_parse("SCAN_BUDGET", 1000),
            scan_page_size: env_parse("SCAN_PAGE_SIZE", 100),
            purge_batch_size: env_parse("PURGE_BATCH_SIZE", 500),

            // Batching
            batch_max_items: env_parse("BATCH_MAX_ITEMS", 20),
            batch_max_chars: env_parse("BATCH_MAX_CHARS", 4000),
            job_time_budget_secs: env_parse("JOB_TIME_BUDGET_SECS", 180),

            // Retry
            max_attempts: env_parse("MAX_ATTEMPTS", 3),
            retry_delay_ms: env_parse("RETRY_DELAY_MS", 2000),
            rate_limit_delay_ms: env_parse("RATE_LIMIT_DELAY_MS", 10_000),
            max_rate_limit_waits: env_parse("MAX_RATE_LIMIT_WAITS", 5),

            // Global rate limiter (threshold 0 disables it)
            rate_limit_threshold: env_parse("RATE_LIMIT_THRESHOLD", 50),
            rate_limit_window_secs: env_parse("RATE_LIMIT_WINDOW_SECS", 60),
            rate_limit_cooldown_secs: env_parse("RATE_LIMIT_COOLDOWN_SECS", 30),

            // Server
            api_key: env_optional("API_KEY"),
            port: env_parse("PORT", 8080),

            // Schedules
            tagging_schedule: env_or("TAGGING_SCHEDULE", "0 */10 * * * *"),
            purge_schedule: env_or("PURGE_SCHEDULE", "0 30 3 * * *"),
            queue_poll_schedule: env_or("QUEUE_POLL_SCHEDULE", "*/30 * * * * *"),
        })
    }

    /// Settings a translation job cannot run without.
    pub fn validate_translation(&self) -> Result<()> {
        if self.openai_api_key.is_none() {
            bail!("OPENAI_API_KEY not set; translation jobs cannot run");
        }
        if !(self.openai_api_url.starts_with("http://") || self.openai_api_url.starts_with("https://")) {
            bail!("OPENAI_API_URL must be an http(s) URL, got {:?}", self.openai_api_url);
        }
        if self.target_languages.is_empty() {
            bail!("TARGET_LANGUAGES not set; expected a comma-separated list such as \"es,fr\"");
        }
        if self.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.batch_max_items == 0 {
            bail!("BATCH_MAX_ITEMS must be at least 1");
        }
        Ok(())
    }

    pub fn translator_config(&self) -> TranslatorConfig {
        TranslatorConfig {
            api_key: self.openai_api_key.clone(),
            api_url: self.openai_api_url.clone(),
            model: self.openai_model.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            site_language: self.site_language.clone(),
            ..TranslatorConfig::default()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        let delay = Duration::from_millis(self.retry_delay_ms);
        RetryConfig::new(self.max_attempts.max(1), delay)
            .with_max_delay(delay)
            .with_backoff_multiplier(1.0)
            .with_rate_limit(
                Duration::from_millis(self.rate_limit_delay_ms),
                self.max_rate_limit_waits,
            )
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let budget = Duration::from_secs(self.job_time_budget_secs);
        OrchestratorConfig {
            target_langs: self.target_languages.clone(),
            batch_max_items: self.batch_max_items.max(1),
            batch_max_chars: self.batch_max_chars,
            time_budget: budget,
            // Leave a ninth of the budget (at most 20s) for the last batch to land.
            time_margin: (budget / 9).min(Duration::from_secs(20)),
            retry: self.retry_config(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        if self.rate_limit_threshold == 0 {
            return RateLimiter::disabled();
        }
        RateLimiter::new(
            self.rate_limit_threshold,
            Duration::from_secs(self.rate_limit_window_secs),
            Duration::from_secs(self.rate_limit_cooldown_secs),
        )
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            page_size: self.scan_page_size.max(1),
            extract_multilang: self.extract_multilang,
            ..ScanConfig::default()
        }
    }

    pub fn extract_context(&self) -> ExtractContext {
        ExtractContext {
            site_language: self.site_language.clone(),
            interface_language: self.interface_language.clone(),
        }
    }
}
