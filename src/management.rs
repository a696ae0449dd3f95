//! Human edits of stored translations.
//!
//! Editing a target language only touches its record. Editing the source
//! text changes what the identifier stands for, so the identifier is
//! re-derived, every record and mapping is moved under it, and the markers
//! embedded in host content are rewritten to match.

use crate::content::{ContentRow, ContentStore};
use crate::db::{RenamePolicy, TranslationRecord, TranslationWrite, SOURCE_LANG};
use crate::marker;
use crate::registry::{TableRegistry, TableSpec};
use crate::relations::ScopeResolver;
use crate::tagger::Tagger;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const REWRITE_PAGE: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceEdit {
    pub old_hash: String,
    pub new_hash: String,
    /// Records moved to `new_hash`
    pub records_moved: usize,
    /// Content rows whose markers were rewritten
    pub rows_rewritten: usize,
}

pub struct TranslationManager {
    tagger: Tagger,
    store: Arc<dyn ContentStore>,
    registry: Arc<TableRegistry>,
}

impl TranslationManager {
    pub fn new(tagger: Tagger, store: Arc<dyn ContentStore>, registry: Arc<TableRegistry>) -> Self {
        Self {
            tagger,
            store,
            registry,
        }
    }

    /// Store a human translation; it counts as reviewed as of now.
    pub fn edit_translation(&self, hash: &str, lang: &str, text: &str) -> Result<TranslationRecord> {
        let lang = lang.trim().to_lowercase();
        if lang == SOURCE_LANG {
            bail!("Use a source edit to change the source text of {}", hash);
        }
        if lang.is_empty() {
            bail!("Language code is required");
        }

        let db = self.tagger.db();
        let source = db
            .get_source(hash)?
            .with_context(|| format!("Unknown identifier {}", hash))?;

        db.upsert(hash, &lang, text, source.level, true)?;
        info!("Human translation stored for {} [{}]", hash, lang);

        db.get(hash, &lang)?
            .with_context(|| format!("Record {} [{}] vanished after write", hash, lang))
    }

    /// Confirm an existing translation without changing its text.
    pub fn mark_reviewed(&self, hash: &str, lang: &str) -> Result<TranslationRecord> {
        let db = self.tagger.db();
        let record = db
            .get(hash, lang)?
            .with_context(|| format!("No {} translation for {}", lang, hash))?;
        self.edit_translation(hash, lang, &record.text)
    }

    /// Replace the source text of `hash`.
    ///
    /// When the new text maps to a different identifier, records and
    /// mappings move there under `policy` and content markers follow.
    pub fn edit_source(&self, hash: &str, new_text: &str, policy: RenamePolicy) -> Result<SourceEdit> {
        let normalized = new_text.trim();
        if normalized.is_empty() {
            bail!("Source text of {} cannot be empty", hash);
        }

        let db = self.tagger.db();
        let source = db
            .get_source(hash)?
            .with_context(|| format!("Unknown identifier {}", hash))?;

        if source.text == normalized {
            debug!("Source of {} unchanged", hash);
            return Ok(SourceEdit {
                old_hash: hash.to_string(),
                new_hash: hash.to_string(),
                records_moved: 0,
                rows_rewritten: 0,
            });
        }

        let new_hash = self.tagger.identifier_for(normalized)?;
        let records_moved = if new_hash == hash {
            0
        } else {
            db.rename_hash(hash, &new_hash, policy)?
        };

        db.upsert_batch(&[TranslationWrite {
            hash: new_hash.clone(),
            lang: SOURCE_LANG.to_string(),
            text: normalized.to_string(),
            level: source.level,
            human: true,
        }])?;

        let rows_rewritten = if new_hash == hash {
            0
        } else {
            self.rewrite_markers(hash, &new_hash)?
        };

        info!(
            "Source of {} edited; now {} ({} records moved, {} rows rewritten)",
            hash, new_hash, records_moved, rows_rewritten
        );
        Ok(SourceEdit {
            old_hash: hash.to_string(),
            new_hash,
            records_moved,
            rows_rewritten,
        })
    }

    /// Point every marker of `old` in host content at `new`.
    ///
    /// Every registered table is paged through in full; scope mappings may
    /// be missing for rows that still carry the marker. Rewritten rows in
    /// scoped tables get their mapping to `new` restored. A table that cannot
    /// be read or written is logged and skipped.
    fn rewrite_markers(&self, old: &str, new: &str) -> Result<usize> {
        let mut resolver = ScopeResolver::new();
        let mut rewritten = 0;

        for spec in self.registry.tables() {
            match self.rewrite_table(spec, old, new, &mut resolver) {
                Ok(count) => rewritten += count,
                Err(e) => warn!("Could not rewrite markers in {}: {:#}", spec.name, e),
            }
        }

        Ok(rewritten)
    }

    fn rewrite_table(
        &self,
        spec: &TableSpec,
        old: &str,
        new: &str,
        resolver: &mut ScopeResolver,
    ) -> Result<usize> {
        let columns = spec.scan_columns();
        let mut after = 0;
        let mut rewritten = 0;
        loop {
            let rows = self.store.read_page(&spec.name, &columns, after, REWRITE_PAGE)?;
            let Some(last) = rows.last() else {
                return Ok(rewritten);
            };
            after = last.id;

            for row in &rows {
                if !self.rewrite_row(spec, row, old, new)? {
                    continue;
                }
                rewritten += 1;
                if let Some(scope_id) = resolver.resolve(self.store.as_ref(), spec, row)? {
                    self.tagger.db().ensure_mapping(new, scope_id)?;
                }
            }
        }
    }

    fn rewrite_row(&self, spec: &TableSpec, row: &ContentRow, old: &str, new: &str) -> Result<bool> {
        let changes: Vec<(String, String)> = spec
            .fields
            .iter()
            .filter_map(|field| {
                let text = row.text(field)?;
                marker::find_all(text)
                    .contains(&old)
                    .then(|| (field.clone(), marker::replace_hash(text, old, new)))
            })
            .collect();

        if changes.is_empty() {
            return Ok(false);
        }
        self.store.update_fields(&spec.name, row.id, &changes)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::SqliteContentStore;
    use crate::db::{Database, RenameConflict, ScopeLevel};
    use std::time::Duration;

    const REGISTRY: &str = r#"{ "scope_table": "course", "tables": [
        { "name": "course", "fields": ["fullname"], "scope": { "kind": "scope" } },
        { "name": "page", "fields": ["name", "intro"],
          "scope": { "kind": "via", "hops": [ { "column": "course", "table": "course" } ] } },
        { "name": "site_block", "fields": ["body"] }
    ] }"#;

    struct Fixture {
        store: Arc<SqliteContentStore>,
        tagger: Tagger,
        manager: TranslationManager,
    }

    fn setup() -> Fixture {
        let store = Arc::new(SqliteContentStore::open_in_memory().expect("open"));
        store
            .execute_batch(
                "CREATE TABLE course (id INTEGER PRIMARY KEY, fullname TEXT);
                 CREATE TABLE page (id INTEGER PRIMARY KEY, course INTEGER, name TEXT, intro TEXT);
                 CREATE TABLE site_block (id INTEGER PRIMARY KEY, body TEXT);
                 INSERT INTO course VALUES (1, 'Biology'), (2, 'Chemistry');",
            )
            .expect("fixture");

        let tagger = Tagger::new(Database::open_in_memory().expect("db"));
        let registry = Arc::new(TableRegistry::from_json(REGISTRY).expect("registry"));
        let manager = TranslationManager::new(tagger.clone(), store.clone(), registry);
        Fixture {
            store,
            tagger,
            manager,
        }
    }

    fn read_field(store: &SqliteContentStore, table: &str, field: &str, id: i64) -> String {
        store
            .read_rows(table, &[field.to_string()], &[id])
            .unwrap()
            .remove(0)
            .text(field)
            .unwrap()
            .to_string()
    }

    // ==================== Translation Edit Tests ====================

    #[test]
    fn test_edit_translation_marks_human_and_reviewed() {
        let f = setup();
        let hash = f.tagger.tag("Submit", Some(1), ScopeLevel::Unit).unwrap().hash.unwrap();
        f.tagger
            .db()
            .upsert(&hash, "es", "Enviar (auto)", ScopeLevel::Unit, false)
            .unwrap();

        let record = f.manager.edit_translation(&hash, "ES", "Enviar").unwrap();
        assert_eq!(record.text, "Enviar");
        assert_eq!(record.lang, "es");
        assert!(record.human);
        assert!(!record.needs_review());
        assert_eq!(record.level, ScopeLevel::Unit);
    }

    #[test]
    fn test_edit_translation_rejects_source_and_unknown() {
        let f = setup();
        let hash = f.tagger.tag("Submit", None, ScopeLevel::Unit).unwrap().hash.unwrap();

        assert!(f.manager.edit_translation(&hash, "source", "x").is_err());
        assert!(f.manager.edit_translation("ZZZZZZZZZZ", "es", "x").is_err());
    }

    #[test]
    fn test_mark_reviewed_clears_needs_review() {
        let f = setup();
        let hash = f.tagger.tag("Submit", None, ScopeLevel::Unit).unwrap().hash.unwrap();
        f.tagger.db().upsert(&hash, "es", "Enviar", ScopeLevel::Unit, false).unwrap();
        assert!(f.tagger.db().get(&hash, "es").unwrap().unwrap().needs_review());

        let record = f.manager.mark_reviewed(&hash, "es").unwrap();
        assert!(!record.needs_review());
        assert_eq!(record.text, "Enviar");
    }

    // ==================== Source Edit Tests ====================

    #[test]
    fn test_edit_source_renames_and_rewrites_markers() {
        let f = setup();
        let tagged = f.tagger.tag("Submit", Some(1), ScopeLevel::Unit).unwrap();
        let old = tagged.hash.unwrap();
        f.store
            .execute_batch(&format!(
                "INSERT INTO page VALUES (10, 1, '{}', 'See <t:{}> here');
                 INSERT INTO page VALUES (11, 2, 'Other {{t:{}}}', NULL);
                 INSERT INTO site_block VALUES (5, 'Footer {{t:{}}}');",
                tagged.text, old, old, old
            ))
            .unwrap();
        f.manager.edit_translation(&old, "es", "Enviar").unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let edit = f.manager.edit_source(&old, "Send", RenamePolicy::Reject).unwrap();
        assert_ne!(edit.new_hash, old);
        assert_eq!(edit.records_moved, 2);
        // page 10 (scope 1), page 11 (scope 2, never mapped) and the site-wide block
        assert_eq!(edit.rows_rewritten, 3);

        let new = &edit.new_hash;
        assert_eq!(read_field(&f.store, "page", "name", 10), format!("Submit {{t:{}}}", new));
        assert_eq!(read_field(&f.store, "page", "intro", 10), format!("See {{t:{}}} here", new));
        assert_eq!(read_field(&f.store, "site_block", "body", 5), format!("Footer {{t:{}}}", new));
        assert_eq!(read_field(&f.store, "page", "name", 11), format!("Other {{t:{}}}", new));

        let db = f.tagger.db();
        assert_eq!(db.get_source(new).unwrap().unwrap().text, "Send");
        assert!(db.get_source(&old).unwrap().is_none());
        assert_eq!(db.scopes_for_hash(new).unwrap(), vec![1, 2]);
        let es = db.get(new, "es").unwrap().unwrap();
        assert!(es.needs_review());
    }

    #[test]
    fn test_edit_source_follows_markers_without_mapping() {
        let f = setup();
        let old = f.tagger.tag("Submit", Some(1), ScopeLevel::Unit).unwrap().hash.unwrap();
        // Copied into course 2 after tagging; no mapping for scope 2.
        f.store
            .execute_batch(&format!("INSERT INTO page VALUES (11, 2, 'Other {{t:{}}}', NULL);", old))
            .unwrap();
        f.manager.edit_translation(&old, "es", "Enviar").unwrap();

        let edit = f.manager.edit_source(&old, "Send", RenamePolicy::Reject).unwrap();

        let name = read_field(&f.store, "page", "name", 11);
        let hash = marker::find_hash(&name).unwrap();
        assert_eq!(hash, edit.new_hash);
        let db = f.tagger.db();
        assert_eq!(db.list_languages(hash).unwrap(), vec!["es".to_string(), "source".to_string()]);
        assert!(db.scopes_for_hash(hash).unwrap().contains(&2));
    }

    #[test]
    fn test_edit_source_conflict_rejected_by_default() {
        let f = setup();
        let old = f.tagger.tag("Submit", None, ScopeLevel::Unit).unwrap().hash.unwrap();
        let existing = f.tagger.tag("Send", None, ScopeLevel::Unit).unwrap().hash.unwrap();

        let err = f.manager.edit_source(&old, "Send", RenamePolicy::Reject).unwrap_err();
        assert!(err.downcast_ref::<RenameConflict>().is_some());
        assert_eq!(f.tagger.db().get_source(&old).unwrap().unwrap().text, "Submit");
        assert_eq!(f.tagger.db().get_source(&existing).unwrap().unwrap().text, "Send");
    }

    #[test]
    fn test_edit_source_merge_keeps_target_records() {
        let f = setup();
        let old = f.tagger.tag("Submit", None, ScopeLevel::Unit).unwrap().hash.unwrap();
        let existing = f.tagger.tag("Send", None, ScopeLevel::Unit).unwrap().hash.unwrap();
        let db = f.tagger.db();
        db.upsert(&old, "es", "Enviar", ScopeLevel::Unit, true).unwrap();
        db.upsert(&old, "fr", "Soumettre", ScopeLevel::Unit, true).unwrap();
        db.upsert(&existing, "es", "Mandar", ScopeLevel::Unit, true).unwrap();

        let edit = f.manager.edit_source(&old, "Send", RenamePolicy::Merge).unwrap();
        assert_eq!(edit.new_hash, existing);
        assert_eq!(db.get(&existing, "es").unwrap().unwrap().text, "Mandar");
        assert_eq!(db.get(&existing, "fr").unwrap().unwrap().text, "Soumettre");
        assert!(db.list_languages(&old).unwrap().is_empty());
    }

    #[test]
    fn test_edit_source_unchanged_text_is_noop() {
        let f = setup();
        let old = f.tagger.tag("Submit", None, ScopeLevel::Unit).unwrap().hash.unwrap();

        let edit = f.manager.edit_source(&old, "  Submit ", RenamePolicy::Reject).unwrap();
        assert_eq!(edit.new_hash, old);
        assert_eq!(edit.records_moved, 0);
        assert!(f.manager.edit_source(&old, "   ", RenamePolicy::Reject).is_err());
    }
}
