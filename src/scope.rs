//! Scope mappings and their garbage collection.

use crate::content::ContentStore;
use crate::db::{CursorPosition, Database, MappingRow};
use crate::marker;
use crate::registry::{ScopeRelation, TableRegistry, TableSpec};
use crate::relations::rows_in_scope;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const PURGE_CURSOR: &str = "purge";
const PURGE_CURSOR_TABLE: &str = "scope_mappings";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Pass 1: mappings whose scope no longer exists.
    pub missing_scope: usize,
    /// Pass 2: mappings whose identifier has no record.
    pub orphaned: usize,
    /// Pass 3: mappings checked against live content.
    pub checked: usize,
    /// Pass 3: mappings whose marker is gone from the scope.
    pub stale: usize,
    /// Pass 3: scopes left alone because a table could not be read.
    pub scopes_skipped: usize,
}

impl PurgeReport {
    pub fn deleted(&self) -> usize {
        self.missing_scope + self.orphaned + self.stale
    }
}

pub struct ScopeMapper {
    store: Arc<dyn ContentStore>,
    registry: Arc<TableRegistry>,
    db: Database,
}

impl ScopeMapper {
    pub fn new(store: Arc<dyn ContentStore>, registry: Arc<TableRegistry>, db: Database) -> Self {
        Self { store, registry, db }
    }

    pub fn ensure_mapping(&self, hash: &str, scope_id: i64) -> Result<bool> {
        self.db.ensure_mapping(hash, scope_id)
    }

    /// Three-pass garbage collection; pass 3 checks at most `batch` mappings
    /// per call and resumes where the previous call stopped.
    pub fn purge(&self, batch: usize) -> Result<PurgeReport> {
        let mut report = PurgeReport {
            missing_scope: self.purge_missing_scopes()?,
            orphaned: self.db.delete_orphaned_mappings()?,
            ..PurgeReport::default()
        };
        if report.orphaned > 0 {
            info!("Removed {} mappings without translation records", report.orphaned);
        }

        self.purge_stale_batch(batch, &mut report)?;

        info!(
            "Purge finished: {} deleted ({} missing scope, {} orphaned, {} stale of {} checked)",
            report.deleted(),
            report.missing_scope,
            report.orphaned,
            report.stale,
            report.checked
        );
        Ok(report)
    }

    fn purge_missing_scopes(&self) -> Result<usize> {
        let scopes = self.db.mapped_scopes()?;
        if scopes.is_empty() {
            return Ok(0);
        }

        let existing = match self.store.existing_ids(&self.registry.scope_table, &scopes) {
            Ok(existing) => existing,
            Err(e) => {
                warn!(
                    "Cannot read scope table {}, keeping all mappings: {:#}",
                    self.registry.scope_table, e
                );
                return Ok(0);
            }
        };

        let missing: Vec<i64> = scopes.into_iter().filter(|s| !existing.contains(s)).collect();
        if missing.is_empty() {
            return Ok(0);
        }
        let deleted = self.db.delete_mappings_for_scopes(&missing)?;
        info!("Removed {} mappings of {} deleted scopes", deleted, missing.len());
        Ok(deleted)
    }

    fn purge_stale_batch(&self, batch: usize, report: &mut PurgeReport) -> Result<()> {
        if batch == 0 {
            return Ok(());
        }

        let after = self
            .db
            .load_cursor(PURGE_CURSOR)?
            .map(|pos| pos.last_id)
            .unwrap_or(0);
        let mut rows = self.db.mappings_after(after, batch)?;
        if rows.is_empty() && after > 0 {
            debug!("Purge cursor wrapped around");
            rows = self.db.mappings_after(0, batch)?;
        }

        match rows.last() {
            Some(last) if rows.len() == batch => self.db.save_cursor(
                PURGE_CURSOR,
                &CursorPosition {
                    table: PURGE_CURSOR_TABLE.to_string(),
                    last_id: last.rowid,
                },
            )?,
            _ => self.db.clear_cursor(PURGE_CURSOR)?,
        }

        let mut by_scope: BTreeMap<i64, Vec<MappingRow>> = BTreeMap::new();
        for row in rows {
            by_scope.entry(row.scope_id).or_default().push(row);
        }

        let tables = self.walkable_tables();
        if tables.is_empty() && self.registry.scoped_tables().next().is_some() {
            warn!("No scoped table can be walked, leaving {} scopes alone", by_scope.len());
            report.checked += by_scope.values().map(Vec::len).sum::<usize>();
            report.scopes_skipped += by_scope.len();
            return Ok(());
        }

        let scopes = by_scope.len();
        for (scope_id, mappings) in by_scope {
            report.checked += mappings.len();
            let Some(live) = self.live_hashes(scope_id, &tables) else {
                report.scopes_skipped += 1;
                continue;
            };
            for mapping in mappings {
                if !live.contains(&mapping.hash) && self.db.delete_mapping(&mapping.hash, scope_id)? {
                    debug!("Marker {} no longer appears in scope {}", mapping.hash, scope_id);
                    report.stale += 1;
                }
            }
        }
        if scopes > 0 && report.scopes_skipped == scopes {
            warn!("Every checked scope was skipped; stale mappings are piling up");
        }
        Ok(())
    }

    /// Scoped tables whose registered relation can be walked at all.
    ///
    /// A missing table or column is a registry problem that no retry fixes,
    /// so that table is left out of the live-marker check instead of holding
    /// every scope back. The tagging pass cannot map its rows either, and
    /// mappings come back on the next full pass once the relation is fixed.
    fn walkable_tables(&self) -> Vec<&TableSpec> {
        self.registry
            .scoped_tables()
            .filter(|spec| match self.check_relation(spec) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Relation of {} is broken, ignoring it in this purge: {:#}", spec.name, e);
                    false
                }
            })
            .collect()
    }

    fn check_relation(&self, spec: &TableSpec) -> Result<()> {
        self.store.read_page(&spec.name, &spec.scan_columns(), 0, 1)?;
        if let ScopeRelation::Via { hops } = &spec.scope {
            for pair in hops.windows(2) {
                self.store.ids_where(&pair[0].table, &pair[1].column, &[0])?;
            }
            if let Some(last) = hops.last() {
                self.store.existing_ids(&last.table, &[0])?;
            }
        }
        Ok(())
    }

    /// Every identifier whose marker currently appears in `scope_id`'s content.
    ///
    /// `None` when one of `tables` could not be read, since deleting on
    /// partial knowledge would drop live mappings.
    pub fn live_hashes(&self, scope_id: i64, tables: &[&TableSpec]) -> Option<HashSet<String>> {
        let mut live = HashSet::new();
        let mut complete = true;

        for spec in tables {
            let rows = rows_in_scope(self.store.as_ref(), spec, scope_id)
                .and_then(|ids| self.store.read_rows(&spec.name, &spec.fields, &ids));
            match rows {
                Ok(rows) => {
                    for row in &rows {
                        for field in &spec.fields {
                            if let Some(text) = row.text(field) {
                                live.extend(marker::find_all(text).into_iter().map(str::to_string));
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping table {} while checking scope {}: {:#}", spec.name, scope_id, e);
                    complete = false;
                }
            }
        }

        complete.then_some(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::SqliteContentStore;
    use crate::db::ScopeLevel;

    const REGISTRY: &str = r#"{ "scope_table": "course", "tables": [
        { "name": "course", "fields": ["fullname"], "scope": { "kind": "scope" } },
        { "name": "page", "fields": ["name"],
          "scope": { "kind": "via", "hops": [ { "column": "course", "table": "course" } ] } },
        { "name": "site_block", "fields": ["body"] }
    ] }"#;

    fn setup() -> (Arc<SqliteContentStore>, ScopeMapper) {
        let store = Arc::new(SqliteContentStore::open_in_memory().expect("open"));
        store
            .execute_batch(
                "CREATE TABLE course (id INTEGER PRIMARY KEY, fullname TEXT);
                 CREATE TABLE page (id INTEGER PRIMARY KEY, course INTEGER, name TEXT);
                 INSERT INTO course VALUES (1, 'Biology {t:AAAAAAAAAA}'), (2, 'Chemistry');
                 INSERT INTO page VALUES (10, 1, 'Intro {t:BBBBBBBBBB}'), (11, 2, 'Lab &lt;t:CCCCCCCCCC&gt;');",
            )
            .expect("fixture");

        let db = Database::open_in_memory().expect("db");
        for hash in ["AAAAAAAAAA", "BBBBBBBBBB", "CCCCCCCCCC", "XXXXXXXXXX"] {
            db.insert_source_if_absent(hash, hash, ScopeLevel::Container).unwrap();
        }
        let registry = Arc::new(TableRegistry::from_json(REGISTRY).expect("registry"));
        (store.clone(), ScopeMapper::new(store, registry, db))
    }

    #[test]
    fn test_live_hashes_walk_every_scoped_table() {
        let (_store, mapper) = setup();
        let tables = mapper.walkable_tables();
        let live = mapper.live_hashes(1, &tables).unwrap();
        assert_eq!(
            live,
            HashSet::from(["AAAAAAAAAA".to_string(), "BBBBBBBBBB".to_string()])
        );
        assert!(mapper.live_hashes(2, &tables).unwrap().contains("CCCCCCCCCC"));
    }

    #[test]
    fn test_purge_removes_stale_mapping_but_keeps_record() {
        let (_store, mapper) = setup();
        mapper.ensure_mapping("BBBBBBBBBB", 1).unwrap();
        mapper.ensure_mapping("XXXXXXXXXX", 1).unwrap();
        mapper.ensure_mapping("XXXXXXXXXX", 2).unwrap();

        let report = mapper.purge(100).unwrap();
        assert_eq!(report.stale, 2);
        assert_eq!(report.checked, 3);
        assert_eq!(mapper.db.scopes_for_hash("BBBBBBBBBB").unwrap(), vec![1]);
        assert!(mapper.db.scopes_for_hash("XXXXXXXXXX").unwrap().is_empty());
        assert!(mapper.db.get_source("XXXXXXXXXX").unwrap().is_some());
    }

    #[test]
    fn test_gc_keeps_record_mapped_elsewhere() {
        let (store, mapper) = setup();
        mapper.ensure_mapping("BBBBBBBBBB", 1).unwrap();
        mapper.ensure_mapping("BBBBBBBBBB", 2).unwrap();
        store
            .execute_batch("UPDATE page SET name = 'Lab {t:BBBBBBBBBB}' WHERE id = 11;")
            .unwrap();
        store.execute_batch("UPDATE page SET name = 'Intro' WHERE id = 10;").unwrap();

        mapper.purge(100).unwrap();
        assert_eq!(mapper.db.scopes_for_hash("BBBBBBBBBB").unwrap(), vec![2]);
        assert!(mapper.db.get_source("BBBBBBBBBB").unwrap().is_some());
    }

    #[test]
    fn test_purge_removes_deleted_scopes_and_orphans() {
        let (store, mapper) = setup();
        mapper.ensure_mapping("CCCCCCCCCC", 2).unwrap();
        mapper.ensure_mapping("NOTSTORED1", 1).unwrap();
        store.execute_batch("DELETE FROM course WHERE id = 2;").unwrap();

        let report = mapper.purge(0).unwrap();
        assert_eq!(report.missing_scope, 1);
        assert_eq!(report.orphaned, 1);
        assert_eq!(mapper.db.mapping_count().unwrap(), 0);
    }

    #[test]
    fn test_purge_batches_resume_and_wrap() {
        let (_store, mapper) = setup();
        mapper.ensure_mapping("XXXXXXXXXX", 1).unwrap();
        mapper.ensure_mapping("AAAAAAAAAA", 1).unwrap();
        mapper.ensure_mapping("CCCCCCCCCC", 2).unwrap();

        let first = mapper.purge(2).unwrap();
        assert_eq!(first.checked, 2);
        assert_eq!(first.stale, 1);

        let second = mapper.purge(2).unwrap();
        assert_eq!(second.checked, 1);
        assert_eq!(second.stale, 0);

        // Cursor cleared after a short batch: the next call starts over.
        let third = mapper.purge(2).unwrap();
        assert_eq!(third.checked, 2);
    }

    #[test]
    fn test_broken_relation_does_not_block_other_tables() {
        let (store, mapper) = setup();
        store
            .execute_batch(
                "CREATE TABLE quiz (id INTEGER PRIMARY KEY, course INTEGER, title TEXT);
                 INSERT INTO quiz VALUES (1, 1, 'Quiz {t:XXXXXXXXXX}');",
            )
            .unwrap();
        let registry = Arc::new(
            TableRegistry::from_json(
                r#"{ "scope_table": "course", "tables": [
                { "name": "course", "fields": ["fullname"], "scope": { "kind": "scope" } },
                { "name": "page", "fields": ["name"],
                  "scope": { "kind": "via", "hops": [ { "column": "course", "table": "course" } ] } },
                { "name": "quiz", "fields": ["title"],
                  "scope": { "kind": "via", "hops": [ { "column": "course", "table": "course" },
                                                      { "column": "missing", "table": "course" } ] } }
            ] }"#,
            )
            .unwrap(),
        );
        let mapper = ScopeMapper::new(store, registry, mapper.db.clone());
        mapper.ensure_mapping("BBBBBBBBBB", 1).unwrap();
        mapper.ensure_mapping("CCCCCCCCCC", 1).unwrap();

        let tables: Vec<&str> = mapper.walkable_tables().into_iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tables, vec!["course", "page"]);

        let report = mapper.purge(100).unwrap();
        assert_eq!(report.scopes_skipped, 0);
        assert_eq!(report.stale, 1);
        assert_eq!(mapper.db.scopes_for_hash("BBBBBBBBBB").unwrap(), vec![1]);
        assert!(mapper.db.scopes_for_hash("CCCCCCCCCC").unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_store_skips_every_scope() {
        let (store, mapper) = setup();
        mapper.ensure_mapping("XXXXXXXXXX", 1).unwrap();
        store.execute_batch("DROP TABLE page; DROP TABLE course;").unwrap();

        let report = mapper.purge(100).unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.scopes_skipped, 1);
        assert_eq!(mapper.db.scopes_for_hash("XXXXXXXXXX").unwrap(), vec![1]);
    }

    #[test]
    fn test_missing_scope_table_keeps_mappings() {
        let (store, mapper) = setup();
        mapper.ensure_mapping("AAAAAAAAAA", 1).unwrap();
        store.execute_batch("DROP TABLE course;").unwrap();

        let report = mapper.purge(0).unwrap();
        assert_eq!(report.missing_scope, 0);
        assert_eq!(mapper.db.mapping_count().unwrap(), 1);
    }
}
