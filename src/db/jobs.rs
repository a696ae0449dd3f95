use super::models::{JobStatus, QueuedTask, SyncJob};
use super::{now_millis, Database};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const JOB_COLUMNS: &str =
    "id, total, processed, status, failure_reason, target_langs, created_at, updated_at";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<SyncJob> {
    let status: String = row.get(3)?;
    let target_langs: String = row.get(5)?;
    Ok(SyncJob {
        id: row.get(0)?,
        total: row.get::<_, i64>(1)? as usize,
        processed: row.get::<_, i64>(2)? as usize,
        // Rows are only ever written through JobStatus::as_str.
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        failure_reason: row.get(4)?,
        target_langs: target_langs
            .split(',')
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn insert_task(conn: &Connection, job_id: &str, hashes: &[String], now: i64) -> Result<String> {
    let task_id = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(hashes).context("Failed to encode task payload")?;
    conn.execute(
        "INSERT INTO sync_queue (task_id, job_id, hashes, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![task_id, job_id, payload, now],
    )?;
    Ok(task_id)
}

impl Database {
    /// Create a queued job and, when there is work, its first task.
    pub fn create_job(&self, target_langs: &[String], hashes: &[String]) -> Result<SyncJob> {
        let job_id = Uuid::new_v4().to_string();
        let now = now_millis();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sync_jobs (id, total, processed, status, failure_reason, target_langs, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, NULL, ?4, ?5, ?5)",
            params![
                job_id,
                hashes.len() as i64,
                JobStatus::Queued.as_str(),
                target_langs.join(","),
                now
            ],
        )
        .context("Failed to create sync job")?;
        if !hashes.is_empty() {
            insert_task(&tx, &job_id, hashes, now)?;
        }
        let job = tx.query_row(
            &format!("SELECT {} FROM sync_jobs WHERE id = ?1", JOB_COLUMNS),
            params![job_id],
            row_to_job,
        )?;
        tx.commit()?;
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM sync_jobs WHERE id = ?1", JOB_COLUMNS),
                params![job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Most recently created jobs first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<SyncJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_jobs ORDER BY created_at DESC, id LIMIT ?1",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![limit as i64], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// queued|running -> running. Returns false for terminal or unknown jobs.
    pub fn mark_job_running(&self, job_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sync_jobs SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('queued', 'running')",
            params![JobStatus::Running.as_str(), now_millis(), job_id],
        )?;
        Ok(updated > 0)
    }

    /// Persist processed count, clamped to the job total.
    pub fn record_progress(&self, job_id: &str, processed: usize) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_jobs SET processed = MIN(?1, total), updated_at = ?2
             WHERE id = ?3 AND status IN ('queued', 'running')",
            params![processed as i64, now_millis(), job_id],
        )?;
        Ok(())
    }

    pub fn complete_job(&self, job_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sync_jobs SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('queued', 'running')",
            params![JobStatus::Completed.as_str(), now_millis(), job_id],
        )?;
        Ok(updated > 0)
    }

    pub fn fail_job(&self, job_id: &str, reason: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sync_jobs SET status = ?1, failure_reason = ?2, updated_at = ?3
             WHERE id = ?4 AND status IN ('queued', 'running')",
            params![JobStatus::Failed.as_str(), reason, now_millis(), job_id],
        )?;
        Ok(updated > 0)
    }

    /// Claim the oldest task nobody holds.
    ///
    /// Claims older than `stale_after_ms` are treated as abandoned by a crashed
    /// worker and handed out again.
    pub fn claim_next_task(&self, stale_after_ms: i64) -> Result<Option<QueuedTask>> {
        let now = now_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let candidate = tx
            .query_row(
                "SELECT task_id, job_id, hashes, created_at FROM sync_queue
                 WHERE claimed_at IS NULL OR claimed_at < ?1
                 ORDER BY created_at, task_id LIMIT 1",
                params![now - stale_after_ms],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((task_id, job_id, payload, created_at)) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE sync_queue SET claimed_at = ?1 WHERE task_id = ?2",
            params![now, task_id],
        )?;
        tx.commit()?;

        let hashes: Vec<String> = serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt payload for queued task {}", task_id))?;

        Ok(Some(QueuedTask {
            task_id,
            job_id,
            hashes,
            created_at,
        }))
    }

    pub fn finish_task(&self, task_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_queue WHERE task_id = ?1", params![task_id])?;
        Ok(())
    }

    /// Replace a task with a continuation carrying the unprocessed hashes.
    pub fn requeue_remainder(&self, task_id: &str, job_id: &str, remaining: &[String]) -> Result<String> {
        let now = now_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let continuation = insert_task(&tx, job_id, remaining, now)?;
        tx.execute("DELETE FROM sync_queue WHERE task_id = ?1", params![task_id])?;
        tx.commit()?;
        Ok(continuation)
    }

    pub fn pending_task_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
