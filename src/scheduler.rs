use crate::app::App;
use crate::scan::{PassOutcome, PassState};
use crate::scope::PurgeReport;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Set while a job body runs; a tick that finds it set is skipped.
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Initialize and start the scheduler
pub async fn start_scheduler(app: App, cancel: CancellationToken) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Tagging pass
    let running = Arc::new(AtomicBool::new(false));
    let app_clone = app.clone();
    info!("Scheduling tagging pass (cron: {})", app.config.tagging_schedule);
    let job = Job::new_async(app.config.tagging_schedule.as_str(), move |_uuid, _l| {
        let app = app_clone.clone();
        let running = running.clone();
        Box::pin(async move {
            let Some(_guard) = RunGuard::try_acquire(&running) else {
                debug!("Tagging pass still running, skipping tick");
                return;
            };
            if let Err(e) = run_tagging(&app).await {
                error!("Scheduled tagging pass failed: {:#}", e);
            }
        })
    })
    .context("Invalid TAGGING_SCHEDULE")?;
    scheduler.add(job).await?;

    // Scope mapping purge
    let running = Arc::new(AtomicBool::new(false));
    let app_clone = app.clone();
    info!("Scheduling mapping purge (cron: {})", app.config.purge_schedule);
    let job = Job::new_async(app.config.purge_schedule.as_str(), move |_uuid, _l| {
        let app = app_clone.clone();
        let running = running.clone();
        Box::pin(async move {
            let Some(_guard) = RunGuard::try_acquire(&running) else {
                debug!("Purge still running, skipping tick");
                return;
            };
            if let Err(e) = run_purge(&app).await {
                error!("Scheduled purge failed: {:#}", e);
            }
        })
    })
    .context("Invalid PURGE_SCHEDULE")?;
    scheduler.add(job).await?;

    // Translation queue
    let running = Arc::new(AtomicBool::new(false));
    let app_clone = app.clone();
    info!("Scheduling translation queue polling (cron: {})", app.config.queue_poll_schedule);
    let job = Job::new_async(app.config.queue_poll_schedule.as_str(), move |_uuid, _l| {
        let app = app_clone.clone();
        let running = running.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            let Some(_guard) = RunGuard::try_acquire(&running) else {
                return;
            };
            if let Err(e) = poll_queue(&app, &cancel).await {
                error!("Translation queue polling failed: {:#}", e);
            }
        })
    })
    .context("Invalid QUEUE_POLL_SCHEDULE")?;
    scheduler.add(job).await?;

    scheduler.start().await?;
    info!("✓ Scheduler started");

    Ok(scheduler)
}

/// One budgeted tagging pass, off the async runtime.
pub async fn run_tagging(app: &App) -> Result<PassOutcome> {
    let pass = app.tagging_pass();
    let budget = app.config.scan_budget;
    let outcome = tokio::task::spawn_blocking(move || pass.run(budget)).await??;

    match &outcome.state {
        PassState::Idle => info!(
            "Tagging pass complete: {} rows, {} fields changed, {} skipped",
            outcome.rows_processed, outcome.fields_changed, outcome.rows_skipped
        ),
        PassState::Paused { table, last_id } => info!(
            "Tagging pass paused at {}#{}: {} rows, {} fields changed, {} skipped",
            table, last_id, outcome.rows_processed, outcome.fields_changed, outcome.rows_skipped
        ),
    }
    Ok(outcome)
}

pub async fn run_purge(app: &App) -> Result<PurgeReport> {
    let mapper = app.scope_mapper();
    let batch = app.config.purge_batch_size;
    tokio::task::spawn_blocking(move || mapper.purge(batch)).await?
}

/// Run queued translation tasks until the queue is empty.
pub async fn poll_queue(app: &App, cancel: &CancellationToken) -> Result<usize> {
    let ran = app.orchestrator.drain(cancel).await?;
    if ran > 0 {
        info!("Ran {} translation tasks", ran);
    }
    Ok(ran)
}
