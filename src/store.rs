use crate::models::{now_ms, PostRecord};
use crate::Result;
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Key-value metadata store keyed by post number. One writer at a time by
/// design; the handle is owned by whoever opened it and closed exactly once.
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS post_metadata (
  post_number TEXT PRIMARY KEY,
  payload_json TEXT NOT NULL,
  updated_at_ms INTEGER NOT NULL
);
"#,
        )?;
        Ok(())
    }

    pub fn upsert(&self, record: &PostRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT INTO post_metadata (post_number, payload_json, updated_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(post_number) DO UPDATE SET
               payload_json = excluded.payload_json,
               updated_at_ms = excluded.updated_at_ms",
            rusqlite::params![record.post_number, payload, updated_at(record)],
        )?;
        Ok(())
    }

    /// Writes many records in a single transaction.
    pub fn upsert_batch(&mut self, records: &[PostRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO post_metadata (post_number, payload_json, updated_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(post_number) DO UPDATE SET
                   payload_json = excluded.payload_json,
                   updated_at_ms = excluded.updated_at_ms",
            )?;
            for record in records {
                let payload = serde_json::to_string(record)?;
                stmt.execute(rusqlite::params![
                    record.post_number,
                    payload,
                    updated_at(record)
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Loads every stored record. Rows whose payload no longer parses are
    /// skipped rather than blocking the whole load.
    pub fn load_all(&self) -> Result<BTreeMap<String, PostRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT post_number, payload_json FROM post_metadata")?;
        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let post_number: String = row.get(0)?;
            let payload: String = row.get(1)?;
            match serde_json::from_str::<PostRecord>(&payload) {
                Ok(record) => {
                    map.insert(post_number, record);
                }
                Err(_) => continue,
            }
        }
        Ok(map)
    }

    pub fn get(&self, post_number: u64) -> Result<Option<PostRecord>> {
        use rusqlite::OptionalExtension;
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM post_metadata WHERE post_number = ?1",
                [post_number.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| err)?;
        Ok(())
    }
}

fn updated_at(record: &PostRecord) -> u64 {
    if record.saved_at > 0 {
        record.saved_at
    } else {
        now_ms()
    }
}
