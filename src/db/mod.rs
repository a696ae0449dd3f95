//! Translation store backed by SQLite.
//!
//! One database holds everything the engine owns: translation records,
//! scope mappings, scan cursors, sync jobs and the job queue. Host content
//! lives elsewhere and is reached through [`crate::content::ContentStore`].

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

mod cursors;
mod jobs;
mod mappings;
pub mod models;
mod translations;

pub use models::{
    CursorPosition, JobStatus, LanguageStats, QueuedTask, ScopeLevel, SyncJob, TranslationRecord,
    TranslationWrite, UntranslatedItem, SOURCE_LANG,
};
pub use mappings::MappingRow;
pub use translations::{RenameConflict, RenamePolicy};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS translations (
    hash TEXT NOT NULL,
    lang TEXT NOT NULL,
    text TEXT NOT NULL,
    level INTEGER NOT NULL,
    human INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    modified_at INTEGER NOT NULL,
    reviewed_at INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (hash, lang)
);

CREATE INDEX IF NOT EXISTS idx_translations_lang_text ON translations(lang, text);

CREATE TABLE IF NOT EXISTS scope_mappings (
    hash TEXT NOT NULL,
    scope_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (hash, scope_id)
);

CREATE INDEX IF NOT EXISTS idx_scope_mappings_scope ON scope_mappings(scope_id);

CREATE TABLE IF NOT EXISTS scan_cursors (
    name TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    last_id INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_jobs (
    id TEXT PRIMARY KEY,
    total INTEGER NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    failure_reason TEXT,
    target_langs TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_queue (
    task_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    hashes TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    claimed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue(created_at);
"#;

/// Current time in unix milliseconds, the resolution of every stored timestamp.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn new(database_path: &str) -> Result<Self> {
        let conn = Connection::open(database_path)
            .context(format!("Failed to open database at {}", database_path))?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL journal")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to create translation store schema")?;

        info!("Translation store ready at {}", database_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database (tests and dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to create translation store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("translation store connection mutex poisoned"))
    }
}

/// `?, ?, ?` with `n` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_creates_schema() {
        let db = Database::open_in_memory().expect("Should open");
        let conn = db.conn().expect("lock");
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('translations', 'scope_mappings', 'scan_cursors', 'sync_jobs', 'sync_queue')",
                [],
                |row| row.get(0),
            )
            .expect("Should count tables");
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_database_reopening_keeps_data() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("store.db");
        let path_str = db_path.to_str().unwrap();

        {
            let db = Database::new(path_str).expect("Failed to create database");
            db.insert_source_if_absent("AbCdEfGhIj", "Submit", ScopeLevel::Container)
                .expect("Should insert");
        }

        {
            let db = Database::new(path_str).expect("Failed to reopen database");
            let source = db.get_source("AbCdEfGhIj").expect("Should read");
            assert_eq!(source.map(|r| r.text), Some("Submit".to_string()));
        }
    }

    #[test]
    fn test_invalid_database_path() {
        let result = Database::new("/non/existent/path/store.db");
        assert!(result.is_err());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn test_database_clone_shares_connection() {
        let db = Database::open_in_memory().expect("Should open");
        let clone = db.clone();
        db.insert_source_if_absent("AbCdEfGhIj", "Submit", ScopeLevel::Container)
            .expect("Should insert");
        assert!(clone.get_source("AbCdEfGhIj").expect("read").is_some());
    }
}
