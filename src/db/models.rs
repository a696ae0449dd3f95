use serde::{Deserialize, Serialize};

/// Language code reserved for a fragment's original-language text.
pub const SOURCE_LANG: &str = "source";

/// Kind of container that owns a translated fragment.
///
/// The numeric values are what gets stored in the `level` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    System,
    Category,
    #[default]
    Container,
    Unit,
}

impl ScopeLevel {
    pub fn as_i64(self) -> i64 {
        match self {
            ScopeLevel::System => 10,
            ScopeLevel::Category => 40,
            ScopeLevel::Container => 50,
            ScopeLevel::Unit => 70,
        }
    }

    /// Unknown values fall back to `Container`.
    pub fn from_i64(value: i64) -> Self {
        match value {
            10 => ScopeLevel::System,
            40 => ScopeLevel::Category,
            70 => ScopeLevel::Unit,
            _ => ScopeLevel::Container,
        }
    }
}

/// One `(hash, lang)` translation row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationRecord {
    pub hash: String,
    pub lang: String,
    pub text: String,
    pub level: ScopeLevel,
    pub human: bool,
    /// Unix milliseconds
    pub created_at: i64,
    pub modified_at: i64,
    pub reviewed_at: i64,
}

impl TranslationRecord {
    /// A record needs review whenever it changed after it was last reviewed.
    pub fn needs_review(&self) -> bool {
        self.modified_at > self.reviewed_at
    }

    pub fn is_source(&self) -> bool {
        self.lang == SOURCE_LANG
    }
}

/// Input for a write into the translation store.
#[derive(Debug, Clone)]
pub struct TranslationWrite {
    pub hash: String,
    pub lang: String,
    pub text: String,
    pub level: ScopeLevel,
    pub human: bool,
}

/// A source text that lacks at least one requested target language.
#[derive(Debug, Clone, PartialEq)]
pub struct UntranslatedItem {
    pub hash: String,
    pub source_text: String,
    pub level: ScopeLevel,
    pub missing_langs: Vec<String>,
}

/// Per-language totals for the status surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguageStats {
    pub lang: String,
    pub total: usize,
    pub human: usize,
    pub needs_review: usize,
}

/// Persisted position of a resumable scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPosition {
    pub table: String,
    pub last_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Progress record of one translation job.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    pub id: String,
    pub total: usize,
    pub processed: usize,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
    pub target_langs: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncJob {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return if self.status == JobStatus::Completed { 100.0 } else { 0.0 };
        }
        (self.processed as f64 / self.total as f64) * 100.0
    }
}

/// Pending unit of work for a job: the first run or a continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub task_id: String,
    pub job_id: String,
    pub hashes: Vec<String>,
    pub created_at: i64,
}
