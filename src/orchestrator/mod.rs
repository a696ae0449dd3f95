//! Batch translation orchestrator.
//!
//! A job is created with the list of identifiers that miss at least one
//! target language and runs as a sequence of queued tasks. Each task works
//! through batches until it finishes, fails, runs out of wall-clock budget
//! or is cancelled; in the last two cases the unprocessed identifiers go
//! back on the queue as a continuation of the same job.

pub mod batch;
pub mod metrics;
pub mod rate_limit;

pub use metrics::{MetricsReport, TranslationMetrics};
pub use rate_limit::RateLimiter;

use crate::db::{Database, QueuedTask, SyncJob, TranslationWrite, UntranslatedItem};
use crate::retry::{with_retry_policy, RetryConfig};
use crate::translation::{Translator, TranslatorError};
use anyhow::Result;
use batch::{group_items, missing_languages};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Languages used when a job is enqueued without its own list
    pub target_langs: Vec<String>,
    pub batch_max_items: usize,
    pub batch_max_chars: usize,
    /// Wall-clock time one task may run before yielding
    pub time_budget: Duration,
    /// Yield this long before the budget is reached
    pub time_margin: Duration,
    pub retry: RetryConfig,
    /// Claimed tasks older than this are considered abandoned
    pub stale_claim: Duration,
    /// Cap on identifiers per enqueued job
    pub enqueue_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            target_langs: Vec::new(),
            batch_max_items: 20,
            batch_max_chars: 4000,
            time_budget: Duration::from_secs(180),
            time_margin: Duration::from_secs(20),
            retry: RetryConfig::batch_translation(),
            stale_claim: Duration::from_secs(600),
            enqueue_limit: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Budget reached; a continuation holds `remaining` identifiers.
    Yielded { remaining: usize },
    /// Interrupted; a continuation holds `remaining` identifiers.
    Cancelled { remaining: usize },
    Failed { reason: String },
    /// Job missing or already finished; the task was dropped.
    Skipped,
}

#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    translator: Translator,
    limiter: Arc<RateLimiter>,
    metrics: Arc<TranslationMetrics>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        translator: Translator,
        limiter: Arc<RateLimiter>,
        metrics: Arc<TranslationMetrics>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            translator,
            limiter,
            metrics,
            config,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn metrics(&self) -> &Arc<TranslationMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create a job for every source text missing one of `target_langs`
    /// (the configured languages when empty), optionally limited to a scope.
    ///
    /// Configuration problems produce a job that is already failed, so the
    /// caller sees the reason through the usual status surface.
    pub fn enqueue_translation(
        &self,
        target_langs: &[String],
        scope: Option<i64>,
        limit: Option<usize>,
    ) -> Result<SyncJob> {
        let mut langs: Vec<String> = if target_langs.is_empty() {
            self.config.target_langs.clone()
        } else {
            target_langs.to_vec()
        };
        langs.iter_mut().for_each(|l| *l = l.trim().to_lowercase());
        langs.retain(|l| !l.is_empty() && l != crate::db::SOURCE_LANG);
        langs.sort();
        langs.dedup();

        if let Err(reason) = self.translator.preflight(&langs) {
            let job = self.db.create_job(&langs, &[])?;
            self.db.fail_job(&job.id, &reason)?;
            self.metrics.record_job_failed();
            error!("Translation job {} rejected: {}", job.id, reason);
            return self.reload(job);
        }

        let limit = limit.unwrap_or(self.config.enqueue_limit);
        let hashes: Vec<String> = self
            .db
            .list_untranslated(&langs, limit, scope)?
            .into_iter()
            .map(|item| item.hash)
            .collect();

        let job = self.db.create_job(&langs, &hashes)?;
        if hashes.is_empty() {
            self.db.complete_job(&job.id)?;
            info!("Translation job {}: nothing to translate into {:?}", job.id, langs);
            return self.reload(job);
        }

        info!(
            "Queued translation job {} ({} items into {:?}{})",
            job.id,
            hashes.len(),
            langs,
            scope.map(|s| format!(", scope {}", s)).unwrap_or_default()
        );
        Ok(job)
    }

    fn reload(&self, job: SyncJob) -> Result<SyncJob> {
        Ok(self.db.get_job(&job.id)?.unwrap_or(job))
    }

    /// Claim and run the oldest pending task, if any.
    pub async fn run_next(&self, cancel: &CancellationToken) -> Result<Option<(String, TaskOutcome)>> {
        let stale_ms = self.config.stale_claim.as_millis() as i64;
        let Some(task) = self.db.claim_next_task(stale_ms)? else {
            return Ok(None);
        };
        let job_id = task.job_id.clone();
        let outcome = self.run_task(task, cancel).await?;
        Ok(Some((job_id, outcome)))
    }

    /// Run tasks until the queue is empty or `cancel` fires.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<usize> {
        let mut ran = 0;
        while !cancel.is_cancelled() {
            match self.run_next(cancel).await? {
                Some((_, TaskOutcome::Cancelled { .. })) => return Ok(ran + 1),
                Some(_) => ran += 1,
                None => break,
            }
        }
        Ok(ran)
    }

    /// Work through one task of a job.
    pub async fn run_task(&self, task: QueuedTask, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let started = Instant::now();

        let job = match self.db.get_job(&task.job_id)? {
            Some(job) if !job.status.is_terminal() => job,
            Some(job) => {
                debug!("Dropping task {} of finished job {} ({:?})", task.task_id, job.id, job.status);
                self.db.finish_task(&task.task_id)?;
                return Ok(TaskOutcome::Skipped);
            }
            None => {
                warn!("Dropping task {} of unknown job {}", task.task_id, task.job_id);
                self.db.finish_task(&task.task_id)?;
                return Ok(TaskOutcome::Skipped);
            }
        };

        if let Err(reason) = self.translator.preflight(&job.target_langs) {
            return self.fail(&task, &reason);
        }
        if !self.db.mark_job_running(&job.id)? {
            self.db.finish_task(&task.task_id)?;
            return Ok(TaskOutcome::Skipped);
        }

        // Identifiers completed elsewhere, or whose source vanished, count as done.
        let items = self.db.untranslated_for_hashes(&task.hashes, &job.target_langs)?;
        let mut processed = job.processed + (task.hashes.len() - items.len());
        self.db.record_progress(&job.id, processed)?;

        let mut pending: VecDeque<Vec<UntranslatedItem>> =
            group_items(items, self.config.batch_max_items, self.config.batch_max_chars).into();
        info!(
            "Job {}: task {} with {} batches ({}/{} done)",
            job.id,
            task.task_id,
            pending.len(),
            processed,
            job.total
        );

        let mut batches_done = 0usize;
        while let Some(batch) = pending.pop_front() {
            if cancel.is_cancelled() {
                pending.push_front(batch);
                return self.requeue(&task, pending, true);
            }
            if batches_done > 0 && started.elapsed() + self.config.time_margin >= self.config.time_budget {
                pending.push_front(batch);
                return self.requeue(&task, pending, false);
            }

            let langs = missing_languages(&batch);
            let texts: Vec<String> = batch.iter().map(|item| item.source_text.clone()).collect();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pending.push_front(batch);
                    return self.requeue(&task, pending, true);
                }
                result = self.translate_with_retry(&texts, &langs) => result,
            };

            match result {
                Ok(translations) => {
                    let writes = build_writes(&batch, &translations);
                    self.db.upsert_batch(&writes)?;
                    processed += batch.len();
                    self.db.record_progress(&job.id, processed)?;
                    self.metrics.record_items_translated(batch.len());
                    batches_done += 1;
                    debug!(
                        "Job {}: batch of {} items stored ({} records, {}/{})",
                        job.id,
                        batch.len(),
                        writes.len(),
                        processed,
                        job.total
                    );
                }
                Err(e) => {
                    self.metrics.record_batch_failed();
                    let reason = format!("Batch of {} items failed: {}", batch.len(), e);
                    return self.fail(&task, &reason);
                }
            }
        }

        self.db.complete_job(&job.id)?;
        self.db.finish_task(&task.task_id)?;
        self.metrics.record_job_completed();
        info!("Job {} completed ({} items)", job.id, job.total);
        Ok(TaskOutcome::Completed)
    }

    async fn translate_with_retry(
        &self,
        texts: &[String],
        langs: &[String],
    ) -> Result<Vec<HashMap<String, String>>, TranslatorError> {
        with_retry_policy(
            &self.config.retry,
            &format!("Translation batch ({} texts)", texts.len()),
            || self.attempt(texts, langs),
            TranslatorError::retry_action,
        )
        .await
    }

    async fn attempt(
        &self,
        texts: &[String],
        langs: &[String],
    ) -> Result<Vec<HashMap<String, String>>, TranslatorError> {
        if self.limiter.acquire().await {
            self.metrics.record_cooldown();
        }
        self.metrics.record_api_call();

        let result = self.translator.translate_batch(texts, langs).await;
        if let Err(e) = &result {
            self.metrics.record_api_failure();
            if matches!(e, TranslatorError::RateLimited { .. }) {
                self.metrics.record_rate_limited();
            }
        }
        result
    }

    fn requeue(
        &self,
        task: &QueuedTask,
        pending: VecDeque<Vec<UntranslatedItem>>,
        cancelled: bool,
    ) -> Result<TaskOutcome> {
        let remaining: Vec<String> = pending.into_iter().flatten().map(|item| item.hash).collect();
        let continuation = self
            .db
            .requeue_remainder(&task.task_id, &task.job_id, &remaining)?;

        let count = remaining.len();
        if cancelled {
            warn!(
                "Job {} interrupted; {} items re-queued as task {}",
                task.job_id, count, continuation
            );
            Ok(TaskOutcome::Cancelled { remaining: count })
        } else {
            info!(
                "Job {} reached its time budget; {} items continue in task {}",
                task.job_id, count, continuation
            );
            Ok(TaskOutcome::Yielded { remaining: count })
        }
    }

    fn fail(&self, task: &QueuedTask, reason: &str) -> Result<TaskOutcome> {
        error!("Job {} failed: {}", task.job_id, reason);
        self.db.fail_job(&task.job_id, reason)?;
        self.db.finish_task(&task.task_id)?;
        self.metrics.record_job_failed();
        Ok(TaskOutcome::Failed {
            reason: reason.to_string(),
        })
    }
}

/// Records for the languages each item was missing; machine-originated.
fn build_writes(
    batch: &[UntranslatedItem],
    translations: &[HashMap<String, String>],
) -> Vec<TranslationWrite> {
    batch
        .iter()
        .zip(translations)
        .flat_map(|(item, by_lang)| {
            item.missing_langs.iter().filter_map(move |lang| {
                by_lang.get(lang).map(|text| TranslationWrite {
                    hash: item.hash.clone(),
                    lang: lang.clone(),
                    text: text.clone(),
                    level: item.level,
                    human: false,
                })
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobStatus, ScopeLevel};
    use crate::translation::TranslatorConfig;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn chat_response(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        })
    }

    fn langs(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    fn create_orchestrator(api_url: &str, api_key: Option<&str>, batch_max_items: usize) -> Orchestrator {
        let translator = Translator::new(TranslatorConfig {
            api_key: api_key.map(str::to_string),
            api_url: api_url.to_string(),
            request_timeout: Duration::from_secs(5),
            ..TranslatorConfig::default()
        })
        .expect("client");
        Orchestrator::new(
            Database::open_in_memory().expect("db"),
            translator,
            Arc::new(RateLimiter::disabled()),
            Arc::new(TranslationMetrics::new()),
            OrchestratorConfig {
                target_langs: langs(&["es"]),
                batch_max_items,
                retry: RetryConfig::new(2, Duration::from_millis(1))
                    .with_backoff_multiplier(1.0)
                    .with_rate_limit(Duration::from_millis(1), 3),
                ..OrchestratorConfig::default()
            },
        )
    }

    fn seed(orchestrator: &Orchestrator, sources: &[(&str, &str)]) {
        for (hash, text) in sources {
            orchestrator
                .db()
                .insert_source_if_absent(hash, text, ScopeLevel::Container)
                .unwrap();
        }
    }

    async fn run_one(orchestrator: &Orchestrator) -> TaskOutcome {
        orchestrator
            .run_next(&CancellationToken::new())
            .await
            .unwrap()
            .expect("a queued task")
            .1
    }

    // ==================== Enqueue Tests ====================

    #[tokio::test]
    async fn test_enqueue_empty_job_completes_immediately() {
        let orchestrator = create_orchestrator("http://127.0.0.1:1/v1", Some("key"), 10);
        let job = orchestrator.enqueue_translation(&[], None, None).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total, 0);
        assert_eq!(job.percentage(), 100.0);
        assert_eq!(orchestrator.db().pending_task_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_without_api_key_fails_fast() {
        let orchestrator = create_orchestrator("http://127.0.0.1:1/v1", None, 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "Submit")]);

        let job = orchestrator.enqueue_translation(&[], None, None).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("OPENAI_API_KEY"));
        assert_eq!(orchestrator.db().pending_task_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_respects_scope_and_languages() {
        let orchestrator = create_orchestrator("http://127.0.0.1:1/v1", Some("key"), 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "Submit"), ("BBBBBBBBBB", "Cancel")]);
        orchestrator.db().ensure_mapping("AAAAAAAAAA", 7).unwrap();

        let job = orchestrator.enqueue_translation(&langs(&["FR", "fr", "source"]), Some(7), None).unwrap();
        assert_eq!(job.total, 1);
        assert_eq!(job.target_langs, langs(&["fr"]));
        assert_eq!(job.status, JobStatus::Queued);
    }

    // ==================== Run Tests ====================

    #[tokio::test]
    async fn test_run_translates_and_completes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(
                r#"[{"es":"Cancelar"},{"es":"Enviar"}]"#,
            )))
            .expect(1)
            .mount(&mock_server)
            .await;

        let orchestrator = create_orchestrator(&mock_server.uri(), Some("key"), 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "Cancel"), ("BBBBBBBBBB", "Submit")]);
        let job = orchestrator.enqueue_translation(&[], None, None).unwrap();

        assert_eq!(run_one(&orchestrator).await, TaskOutcome::Completed);

        let job = orchestrator.db().get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed, 2);

        let record = orchestrator.db().get("BBBBBBBBBB", "es").unwrap().unwrap();
        assert_eq!(record.text, "Enviar");
        assert!(!record.human);
        assert_eq!(orchestrator.metrics().report().items_translated, 2);
    }

    #[tokio::test]
    async fn test_only_missing_languages_are_written() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(
                r#"[{"es":"Machine","fr":"Envoyer"}]"#,
            )))
            .mount(&mock_server)
            .await;

        let orchestrator = create_orchestrator(&mock_server.uri(), Some("key"), 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "Submit")]);
        orchestrator
            .db()
            .upsert("AAAAAAAAAA", "es", "Enviar", ScopeLevel::Container, true)
            .unwrap();

        orchestrator.enqueue_translation(&langs(&["es", "fr"]), None, None).unwrap();
        assert_eq!(run_one(&orchestrator).await, TaskOutcome::Completed);

        let es = orchestrator.db().get("AAAAAAAAAA", "es").unwrap().unwrap();
        assert_eq!(es.text, "Enviar");
        assert!(es.human);
        assert_eq!(orchestrator.db().get("AAAAAAAAAA", "fr").unwrap().unwrap().text, "Envoyer");
    }

    #[tokio::test]
    async fn test_wrong_cardinality_is_retried_without_partial_write() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(
                r#"[{"es":"Uno"},{"es":"Dos"}]"#,
            )))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(
                r#"[{"es":"Uno"},{"es":"Dos"},{"es":"Tres"}]"#,
            )))
            .mount(&mock_server)
            .await;

        let orchestrator = create_orchestrator(&mock_server.uri(), Some("key"), 10);
        seed(
            &orchestrator,
            &[("AAAAAAAAAA", "One"), ("BBBBBBBBBB", "Two"), ("CCCCCCCCCC", "Three")],
        );
        orchestrator.enqueue_translation(&[], None, None).unwrap();

        assert_eq!(run_one(&orchestrator).await, TaskOutcome::Completed);
        assert_eq!(orchestrator.metrics().api_calls(), 2);
        assert_eq!(orchestrator.db().get("CCCCCCCCCC", "es").unwrap().unwrap().text, "Tres");
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_job_but_keep_earlier_batches() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(r#"[{"es":"Uno"}]"#)))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let orchestrator = create_orchestrator(&mock_server.uri(), Some("key"), 1);
        seed(&orchestrator, &[("AAAAAAAAAA", "One"), ("BBBBBBBBBB", "Two")]);
        let job = orchestrator.enqueue_translation(&[], None, None).unwrap();

        let outcome = run_one(&orchestrator).await;
        assert!(matches!(outcome, TaskOutcome::Failed { ref reason } if reason.contains("500")));

        let job = orchestrator.db().get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed, 1);
        assert!(job.failure_reason.is_some());
        assert_eq!(orchestrator.db().get("AAAAAAAAAA", "es").unwrap().unwrap().text, "Uno");
        assert!(orchestrator.db().get("BBBBBBBBBB", "es").unwrap().is_none());
        assert_eq!(orchestrator.db().pending_task_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_not_found_fails_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let orchestrator = create_orchestrator(&mock_server.uri(), Some("key"), 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "One")]);
        orchestrator.enqueue_translation(&[], None, None).unwrap();

        let outcome = run_one(&orchestrator).await;
        assert!(matches!(outcome, TaskOutcome::Failed { ref reason } if reason.contains("not found")));
    }

    #[tokio::test]
    async fn test_rate_limit_waits_do_not_fail_the_batch() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(3)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(r#"[{"es":"Uno"}]"#)))
            .mount(&mock_server)
            .await;

        let orchestrator = create_orchestrator(&mock_server.uri(), Some("key"), 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "One")]);
        orchestrator.enqueue_translation(&[], None, None).unwrap();

        assert_eq!(run_one(&orchestrator).await, TaskOutcome::Completed);
        assert_eq!(orchestrator.metrics().report().rate_limited, 3);
    }

    #[tokio::test]
    async fn test_budget_yields_continuation_and_job_finishes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(r#"[{"es":"Hecho"}]"#)))
            .mount(&mock_server)
            .await;

        let mut orchestrator = create_orchestrator(&mock_server.uri(), Some("key"), 1);
        orchestrator.config.time_budget = Duration::ZERO;
        orchestrator.config.time_margin = Duration::ZERO;
        seed(
            &orchestrator,
            &[("AAAAAAAAAA", "One"), ("BBBBBBBBBB", "Two"), ("CCCCCCCCCC", "Three")],
        );
        let job = orchestrator.enqueue_translation(&[], None, None).unwrap();

        assert_eq!(run_one(&orchestrator).await, TaskOutcome::Yielded { remaining: 2 });
        let mid = orchestrator.db().get_job(&job.id).unwrap().unwrap();
        assert_eq!(mid.status, JobStatus::Running);
        assert_eq!(mid.processed, 1);
        assert_eq!(mid.total, 3);

        let ran = orchestrator.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(ran, 2);
        let done = orchestrator.db().get_job(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed, 3);
    }

    #[tokio::test]
    async fn test_cancel_requeues_everything_unwritten() {
        let orchestrator = create_orchestrator("http://127.0.0.1:1/v1", Some("key"), 1);
        seed(&orchestrator, &[("AAAAAAAAAA", "One"), ("BBBBBBBBBB", "Two")]);
        let job = orchestrator.enqueue_translation(&[], None, None).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_, outcome) = orchestrator.run_next(&cancel).await.unwrap().unwrap();

        assert_eq!(outcome, TaskOutcome::Cancelled { remaining: 2 });
        assert!(orchestrator.db().get("AAAAAAAAAA", "es").unwrap().is_none());
        assert_eq!(orchestrator.db().pending_task_count().unwrap(), 1);
        let job = orchestrator.db().get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_during_api_call() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_response(r#"[{"es":"Uno"}]"#))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let orchestrator = create_orchestrator(&mock_server.uri(), Some("key"), 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "One")]);
        orchestrator.enqueue_translation(&[], None, None).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let (_, outcome) = orchestrator.run_next(&cancel).await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled { remaining: 1 });
        assert!(orchestrator.db().get("AAAAAAAAAA", "es").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_of_finished_job_is_skipped() {
        let orchestrator = create_orchestrator("http://127.0.0.1:1/v1", Some("key"), 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "One")]);
        let job = orchestrator.enqueue_translation(&[], None, None).unwrap();
        orchestrator.db().fail_job(&job.id, "stopped by operator").unwrap();

        assert_eq!(run_one(&orchestrator).await, TaskOutcome::Skipped);
        assert_eq!(orchestrator.db().pending_task_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_already_translated_items_count_as_processed() {
        let orchestrator = create_orchestrator("http://127.0.0.1:1/v1", Some("key"), 10);
        seed(&orchestrator, &[("AAAAAAAAAA", "One")]);
        let job = orchestrator.enqueue_translation(&[], None, None).unwrap();
        orchestrator
            .db()
            .upsert("AAAAAAAAAA", "es", "Uno", ScopeLevel::Container, true)
            .unwrap();

        assert_eq!(run_one(&orchestrator).await, TaskOutcome::Completed);
        let job = orchestrator.db().get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.processed, 1);
        assert_eq!(orchestrator.metrics().api_calls(), 0);
    }

    #[test]
    fn test_build_writes_skips_languages_already_present() {
        let batch = vec![UntranslatedItem {
            hash: "AAAAAAAAAA".to_string(),
            source_text: "Submit".to_string(),
            level: ScopeLevel::Unit,
            missing_langs: langs(&["fr"]),
        }];
        let translations = vec![HashMap::from([
            ("es".to_string(), "Enviar".to_string()),
            ("fr".to_string(), "Envoyer".to_string()),
        ])];

        let writes = build_writes(&batch, &translations);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].lang, "fr");
        assert_eq!(writes[0].level, ScopeLevel::Unit);
        assert!(!writes[0].human);
    }
}
