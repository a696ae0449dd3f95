use super::models::CursorPosition;
use super::{now_millis, Database};
use anyhow::Result;
use rusqlite::{params, OptionalExtension};

impl Database {
    /// Load a named cursor. `None` means the scan is idle.
    pub fn load_cursor(&self, name: &str) -> Result<Option<CursorPosition>> {
        let conn = self.conn()?;
        let position = conn
            .query_row(
                "SELECT table_name, last_id FROM scan_cursors WHERE name = ?1",
                params![name],
                |row| {
                    Ok(CursorPosition {
                        table: row.get(0)?,
                        last_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(position)
    }

    pub fn save_cursor(&self, name: &str, position: &CursorPosition) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scan_cursors (name, table_name, last_id, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET table_name = excluded.table_name,
                 last_id = excluded.last_id, updated_at = excluded.updated_at",
            params![name, position.table, position.last_id, now_millis()],
        )?;
        Ok(())
    }

    /// Reset a cursor to idle.
    pub fn clear_cursor(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM scan_cursors WHERE name = ?1", params![name])?;
        Ok(())
    }
}
