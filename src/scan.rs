//! Resumable, budgeted tagging pass over the registered content tables.

use crate::content::{ContentRow, ContentStore};
use crate::db::{CursorPosition, Database};
use crate::extractor::Extractor;
use crate::registry::{TableRegistry, TableSpec};
use crate::relations::ScopeResolver;
use crate::tagger::Tagger;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Cursor row this pass owns; concurrent passes need distinct names.
    pub cursor_name: String,
    pub page_size: usize,
    pub extract_multilang: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cursor_name: "tagging".to_string(),
            page_size: 100,
            extract_multilang: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassState {
    /// Every table was scanned; the next run starts from the beginning.
    Idle,
    /// Budget ran out; the next run resumes after `last_id` in `table`.
    Paused { table: String, last_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub state: PassState,
    pub rows_processed: usize,
    pub fields_changed: usize,
    pub rows_skipped: usize,
}

impl PassOutcome {
    fn new() -> Self {
        Self {
            state: PassState::Idle,
            rows_processed: 0,
            fields_changed: 0,
            rows_skipped: 0,
        }
    }
}

/// What happened to one row.
enum RowResult {
    Done { fields_changed: usize },
    Skipped,
    /// The table's scope chain cannot be walked; give up on the table.
    BrokenTable,
}

pub struct TaggingPass {
    store: Arc<dyn ContentStore>,
    registry: Arc<TableRegistry>,
    tagger: Tagger,
    extractor: Extractor,
    config: ScanConfig,
}

impl TaggingPass {
    pub fn new(
        store: Arc<dyn ContentStore>,
        registry: Arc<TableRegistry>,
        tagger: Tagger,
        extractor: Extractor,
        config: ScanConfig,
    ) -> Self {
        Self {
            store,
            registry,
            tagger,
            extractor,
            config,
        }
    }

    fn db(&self) -> &Database {
        self.tagger.db()
    }

    /// Where the next run will start, if a previous run paused.
    pub fn position(&self) -> Result<Option<CursorPosition>> {
        self.db().load_cursor(&self.config.cursor_name)
    }

    /// Process at most `budget` rows, continuing from the persisted cursor.
    pub fn run(&self, budget: usize) -> Result<PassOutcome> {
        let tables = self.registry.tables();
        let cursor_name = self.config.cursor_name.as_str();
        let mut outcome = PassOutcome::new();

        let (mut table_idx, mut last_id) = match self.db().load_cursor(cursor_name)? {
            Some(pos) => match self.registry.position(&pos.table) {
                Some(idx) => (idx, pos.last_id),
                None => {
                    warn!(
                        "Cursor {} points at unregistered table {}, moving on",
                        cursor_name, pos.table
                    );
                    let next = tables
                        .iter()
                        .position(|t| t.name > pos.table)
                        .unwrap_or(tables.len());
                    (next, 0)
                }
            },
            None => (0, 0),
        };

        if let Some(spec) = tables.get(table_idx) {
            info!(
                "Tagging pass {} starting at {} after id {} (budget {})",
                cursor_name, spec.name, last_id, budget
            );
        }

        let mut resolver = ScopeResolver::new();

        while let Some(spec) = tables.get(table_idx) {
            if outcome.rows_processed >= budget {
                let position = CursorPosition {
                    table: spec.name.clone(),
                    last_id,
                };
                self.db().save_cursor(cursor_name, &position)?;
                info!(
                    "Tagging pass {} paused at {} id {} ({} rows, {} fields changed)",
                    cursor_name, spec.name, last_id, outcome.rows_processed, outcome.fields_changed
                );
                outcome.state = PassState::Paused {
                    table: position.table,
                    last_id,
                };
                return Ok(outcome);
            }

            let limit = self.config.page_size.max(1).min(budget - outcome.rows_processed);
            let page = match self.store.read_page(&spec.name, &spec.scan_columns(), last_id, limit) {
                Ok(page) => page,
                Err(e) => {
                    warn!("Skipping table {}: {:#}", spec.name, e);
                    table_idx += 1;
                    last_id = 0;
                    resolver.clear();
                    continue;
                }
            };

            if page.is_empty() {
                debug!("Table {} exhausted", spec.name);
                table_idx += 1;
                last_id = 0;
                resolver.clear();
                if let Some(next) = tables.get(table_idx) {
                    self.db().save_cursor(
                        cursor_name,
                        &CursorPosition {
                            table: next.name.clone(),
                            last_id: 0,
                        },
                    )?;
                }
                continue;
            }

            let mut broken = false;
            for row in &page {
                match self.process_row(spec, row, &mut resolver)? {
                    RowResult::Done { fields_changed } => outcome.fields_changed += fields_changed,
                    RowResult::Skipped => outcome.rows_skipped += 1,
                    RowResult::BrokenTable => {
                        broken = true;
                        break;
                    }
                }
                outcome.rows_processed += 1;
                last_id = row.id;
            }

            if broken {
                table_idx += 1;
                last_id = 0;
                resolver.clear();
                continue;
            }

            self.db().save_cursor(
                cursor_name,
                &CursorPosition {
                    table: spec.name.clone(),
                    last_id,
                },
            )?;
        }

        self.db().clear_cursor(cursor_name)?;
        info!(
            "Tagging pass {} complete ({} rows, {} fields changed, {} skipped)",
            cursor_name, outcome.rows_processed, outcome.fields_changed, outcome.rows_skipped
        );
        Ok(outcome)
    }

    fn process_row(
        &self,
        spec: &TableSpec,
        row: &ContentRow,
        resolver: &mut ScopeResolver,
    ) -> Result<RowResult> {
        let scope = if spec.scope.is_scoped() {
            match resolver.resolve(self.store.as_ref(), spec, row) {
                Ok(Some(scope_id)) => Some(scope_id),
                Ok(None) => {
                    warn!("No owning scope for {} id {}, skipping row", spec.name, row.id);
                    return Ok(RowResult::Skipped);
                }
                Err(e) => {
                    warn!("Cannot resolve scopes of {}, skipping table: {:#}", spec.name, e);
                    return Ok(RowResult::BrokenTable);
                }
            }
        } else {
            None
        };

        let mut changes = Vec::new();
        for field in &spec.fields {
            let Some(text) = row.text(field) else {
                continue;
            };

            let extracted = if self.config.extract_multilang {
                self.extractor.extract(text, scope, spec.level)?
            } else {
                None
            };
            let new_text = match extracted {
                Some(outcome) => Some(outcome.text),
                None => {
                    let outcome = self.tagger.tag(text, scope, spec.level)?;
                    outcome.changed.then_some(outcome.text)
                }
            };

            if let Some(new_text) = new_text {
                if new_text != text {
                    changes.push((field.clone(), new_text));
                }
            }
        }

        if changes.is_empty() {
            return Ok(RowResult::Done { fields_changed: 0 });
        }

        match self.store.update_fields(&spec.name, row.id, &changes) {
            Ok(()) => Ok(RowResult::Done {
                fields_changed: changes.len(),
            }),
            Err(e) => {
                warn!("Failed to write {} id {}: {:#}", spec.name, row.id, e);
                Ok(RowResult::Skipped)
            }
        }
    }
}
