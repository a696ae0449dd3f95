use super::models::{
    LanguageStats, ScopeLevel, TranslationRecord, TranslationWrite, UntranslatedItem, SOURCE_LANG,
};
use super::{now_millis, placeholders, Database};
use anyhow::{bail, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

/// What to do when a rename target already owns translation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenamePolicy {
    /// Refuse the rename and leave both identifiers untouched.
    #[default]
    Reject,
    /// Keep the target's records, move the old records whose language is
    /// still free, drop the rest.
    Merge,
}

/// Returned (inside `anyhow::Error`) when a rename would overwrite records.
#[derive(Debug, Error)]
#[error("identifier {new_hash} already has translations for [{}]; refusing to rename {old_hash}", .languages.join(", "))]
pub struct RenameConflict {
    pub old_hash: String,
    pub new_hash: String,
    pub languages: Vec<String>,
}

const RECORD_COLUMNS: &str =
    "hash, lang, text, level, human, created_at, modified_at, reviewed_at";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TranslationRecord> {
    Ok(TranslationRecord {
        hash: row.get(0)?,
        lang: row.get(1)?,
        text: row.get(2)?,
        level: ScopeLevel::from_i64(row.get(3)?),
        human: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        modified_at: row.get(6)?,
        reviewed_at: row.get(7)?,
    })
}

/// Insert or update one record on an open connection or transaction.
fn upsert_on(conn: &Connection, write: &TranslationWrite, now: i64) -> rusqlite::Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT text FROM translations WHERE hash = ?1 AND lang = ?2",
            params![write.hash, write.lang],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(previous_text) => {
            conn.execute(
                "UPDATE translations
                 SET text = ?1, level = ?2, human = ?3, modified_at = ?4,
                     reviewed_at = CASE WHEN ?3 = 1 THEN ?4 ELSE reviewed_at END
                 WHERE hash = ?5 AND lang = ?6",
                params![
                    write.text,
                    write.level.as_i64(),
                    write.human as i64,
                    now,
                    write.hash,
                    write.lang
                ],
            )?;

            // A changed source invalidates every translation derived from it.
            if write.lang == SOURCE_LANG && previous_text != write.text {
                let touched = conn.execute(
                    "UPDATE translations SET modified_at = ?1 WHERE hash = ?2 AND lang != ?3",
                    params![now, write.hash, SOURCE_LANG],
                )?;
                debug!(
                    "Source of {} changed, {} translations now need review",
                    write.hash, touched
                );
            }
        }
        None => {
            let reviewed_at = if write.human { now } else { 0 };
            conn.execute(
                "INSERT INTO translations (hash, lang, text, level, human, created_at, modified_at, reviewed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
                params![
                    write.hash,
                    write.lang,
                    write.text,
                    write.level.as_i64(),
                    write.human as i64,
                    now,
                    reviewed_at
                ],
            )?;
        }
    }

    Ok(())
}

impl Database {
    /// Get one record by identity.
    pub fn get(&self, hash: &str, lang: &str) -> Result<Option<TranslationRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM translations WHERE hash = ?1 AND lang = ?2",
                    RECORD_COLUMNS
                ),
                params![hash, lang],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Get the original-language record of an identifier.
    pub fn get_source(&self, hash: &str) -> Result<Option<TranslationRecord>> {
        self.get(hash, SOURCE_LANG)
    }

    /// Global dedup index: the identifier already used for this exact source text.
    pub fn find_hash_by_source(&self, text: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let hash = conn
            .query_row(
                "SELECT hash FROM translations WHERE lang = ?1 AND text = ?2 ORDER BY created_at LIMIT 1",
                params![SOURCE_LANG, text],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Create the source record unless one exists. Returns true when inserted.
    pub fn insert_source_if_absent(&self, hash: &str, text: &str, level: ScopeLevel) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_millis();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO translations (hash, lang, text, level, human, created_at, modified_at, reviewed_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5, ?5)",
            params![hash, SOURCE_LANG, text, level.as_i64(), now],
        )?;
        Ok(inserted > 0)
    }

    /// Insert or update a record, stamped with the current time.
    pub fn upsert(
        &self,
        hash: &str,
        lang: &str,
        text: &str,
        level: ScopeLevel,
        human: bool,
    ) -> Result<()> {
        self.upsert_at(
            &TranslationWrite {
                hash: hash.to_string(),
                lang: lang.to_string(),
                text: text.to_string(),
                level,
                human,
            },
            now_millis(),
        )
    }

    /// Insert or update a record with an explicit timestamp.
    ///
    /// Existing rows keep `created_at`; human writes also set `reviewed_at`.
    pub fn upsert_at(&self, write: &TranslationWrite, now: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_on(&tx, write, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Write a whole batch in one transaction; either every record lands or none.
    pub fn upsert_batch(&self, writes: &[TranslationWrite]) -> Result<usize> {
        let mut conn = self.conn()?;
        let now = now_millis();
        let tx = conn.transaction()?;
        for write in writes {
            upsert_on(&tx, write, now)?;
        }
        tx.commit()?;
        Ok(writes.len())
    }

    /// Every language code stored for an identifier, `source` included.
    pub fn list_languages(&self, hash: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT lang FROM translations WHERE hash = ?1 ORDER BY lang")?;
        let langs = stmt
            .query_map(params![hash], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(langs)
    }

    /// Every record stored for an identifier.
    pub fn list_records(&self, hash: &str) -> Result<Vec<TranslationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM translations WHERE hash = ?1 ORDER BY lang",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![hash], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Source texts missing at least one of `target_langs`, ordered by identifier.
    ///
    /// With a scope, only identifiers mapped to that scope are considered.
    pub fn list_untranslated(
        &self,
        target_langs: &[String],
        limit: usize,
        scope: Option<i64>,
    ) -> Result<Vec<UntranslatedItem>> {
        if target_langs.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT s.hash, s.text, s.level,
                    (SELECT group_concat(t.lang, ',') FROM translations t WHERE t.hash = s.hash)
             FROM translations s
             WHERE s.lang = ?
               AND (SELECT COUNT(*) FROM translations t
                    WHERE t.hash = s.hash AND t.lang IN ({})) < ?",
            placeholders(target_langs.len())
        );

        let mut values: Vec<Value> = vec![Value::Text(SOURCE_LANG.to_string())];
        values.extend(target_langs.iter().map(|l| Value::Text(l.clone())));
        values.push(Value::Integer(target_langs.len() as i64));

        if let Some(scope_id) = scope {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM scope_mappings m WHERE m.hash = s.hash AND m.scope_id = ?)",
            );
            values.push(Value::Integer(scope_id));
        }

        sql.push_str(" ORDER BY s.hash LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(hash, source_text, level, present)| {
                untranslated_item(hash, source_text, level, present, target_langs)
            })
            .collect())
    }

    /// Re-evaluate specific identifiers against `target_langs`.
    ///
    /// Identifiers without a source record, or already complete, are left out.
    pub fn untranslated_for_hashes(
        &self,
        hashes: &[String],
        target_langs: &[String],
    ) -> Result<Vec<UntranslatedItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.text, s.level,
                    (SELECT group_concat(t.lang, ',') FROM translations t WHERE t.hash = s.hash)
             FROM translations s
             WHERE s.hash = ?1 AND s.lang = ?2",
        )?;

        let mut items = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let row = stmt
                .query_row(params![hash, SOURCE_LANG], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })
                .optional()?;

            if let Some((source_text, level, present)) = row {
                let item = untranslated_item(hash.clone(), source_text, level, present, target_langs);
                if !item.missing_langs.is_empty() {
                    items.push(item);
                }
            }
        }
        Ok(items)
    }

    /// Re-key every record and mapping of `old_hash` to `new_hash` atomically.
    ///
    /// Returns the number of records moved. Fails with [`RenameConflict`]
    /// under [`RenamePolicy::Reject`] when the target already has records.
    pub fn rename_hash(&self, old_hash: &str, new_hash: &str, policy: RenamePolicy) -> Result<usize> {
        if old_hash == new_hash {
            bail!("Cannot rename identifier {} to itself", old_hash);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let occupied: Vec<String> = {
            let mut stmt = tx.prepare("SELECT lang FROM translations WHERE hash = ?1 ORDER BY lang")?;
            let langs = stmt
                .query_map(params![new_hash], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            langs
        };

        if !occupied.is_empty() {
            match policy {
                RenamePolicy::Reject => {
                    return Err(RenameConflict {
                        old_hash: old_hash.to_string(),
                        new_hash: new_hash.to_string(),
                        languages: occupied,
                    }
                    .into());
                }
                RenamePolicy::Merge => {
                    let dropped = tx.execute(
                        "DELETE FROM translations
                         WHERE hash = ?1 AND lang IN (SELECT lang FROM translations WHERE hash = ?2)",
                        params![old_hash, new_hash],
                    )?;
                    info!(
                        "Merging {} into {}: {} conflicting records dropped",
                        old_hash, new_hash, dropped
                    );
                }
            }
        }

        let moved = tx.execute(
            "UPDATE translations SET hash = ?1 WHERE hash = ?2",
            params![new_hash, old_hash],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO scope_mappings (hash, scope_id, created_at)
             SELECT ?1, scope_id, created_at FROM scope_mappings WHERE hash = ?2",
            params![new_hash, old_hash],
        )?;
        tx.execute("DELETE FROM scope_mappings WHERE hash = ?1", params![old_hash])?;
        tx.commit()?;

        info!("Renamed identifier {} -> {} ({} records)", old_hash, new_hash, moved);
        Ok(moved)
    }

    /// Totals per language code.
    pub fn translation_stats(&self) -> Result<Vec<LanguageStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT lang, COUNT(*), SUM(human), SUM(CASE WHEN modified_at > reviewed_at THEN 1 ELSE 0 END)
             FROM translations GROUP BY lang ORDER BY lang",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(LanguageStats {
                    lang: row.get(0)?,
                    total: row.get::<_, i64>(1)? as usize,
                    human: row.get::<_, i64>(2)? as usize,
                    needs_review: row.get::<_, i64>(3)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }
}

fn untranslated_item(
    hash: String,
    source_text: String,
    level: i64,
    present: Option<String>,
    target_langs: &[String],
) -> UntranslatedItem {
    let present: HashSet<&str> = present
        .as_deref()
        .map(|p| p.split(',').collect())
        .unwrap_or_default();
    let missing_langs = target_langs
        .iter()
        .filter(|lang| !present.contains(lang.as_str()))
        .cloned()
        .collect();

    UntranslatedItem {
        hash,
        source_text,
        level: ScopeLevel::from_i64(level),
        missing_langs,
    }
}
