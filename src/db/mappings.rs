use super::{now_millis, placeholders, Database};
use anyhow::Result;
use rusqlite::{params, params_from_iter};

/// One scope mapping together with its rowid, the purge cursor's ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRow {
    pub rowid: i64,
    pub hash: String,
    pub scope_id: i64,
}

impl Database {
    /// Record that `hash` appears inside `scope_id`. Returns true when new.
    pub fn ensure_mapping(&self, hash: &str, scope_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO scope_mappings (hash, scope_id, created_at) VALUES (?1, ?2, ?3)",
            params![hash, scope_id, now_millis()],
        )?;
        Ok(inserted > 0)
    }

    pub fn scopes_for_hash(&self, hash: &str) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT scope_id FROM scope_mappings WHERE hash = ?1 ORDER BY scope_id")?;
        let scopes = stmt
            .query_map(params![hash], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(scopes)
    }

    pub fn hashes_for_scope(&self, scope_id: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT hash FROM scope_mappings WHERE scope_id = ?1 ORDER BY hash")?;
        let hashes = stmt
            .query_map(params![scope_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(hashes)
    }

    pub fn mapped_scopes(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT scope_id FROM scope_mappings ORDER BY scope_id")?;
        let scopes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(scopes)
    }

    pub fn mapping_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM scope_mappings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Delete every mapping that points at one of `scope_ids`.
    pub fn delete_mappings_for_scopes(&self, scope_ids: &[i64]) -> Result<usize> {
        if scope_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let mut deleted = 0;
        for chunk in scope_ids.chunks(500) {
            deleted += conn.execute(
                &format!(
                    "DELETE FROM scope_mappings WHERE scope_id IN ({})",
                    placeholders(chunk.len())
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        Ok(deleted)
    }

    /// Delete mappings whose identifier has no translation record at all.
    pub fn delete_orphaned_mappings(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM scope_mappings
             WHERE NOT EXISTS (SELECT 1 FROM translations t WHERE t.hash = scope_mappings.hash)",
            [],
        )?;
        Ok(deleted)
    }

    /// Next `limit` mappings after `after_rowid`, in rowid order.
    pub fn mappings_after(&self, after_rowid: i64, limit: usize) -> Result<Vec<MappingRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, hash, scope_id FROM scope_mappings WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after_rowid, limit as i64], |row| {
                Ok(MappingRow {
                    rowid: row.get(0)?,
                    hash: row.get(1)?,
                    scope_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_mapping(&self, hash: &str, scope_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM scope_mappings WHERE hash = ?1 AND scope_id = ?2",
            params![hash, scope_id],
        )?;
        Ok(deleted > 0)
    }
}
