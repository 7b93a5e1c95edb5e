//! SQLite-backed storage for correlated raw (request, response) pairs.
//!
//! Schema and insert-or-replace semantics per SPEC_FULL.md §3/§6. `request`
//! and `response` store trimmed payload bytes (header and CRC stripped),
//! matching the system this one supersedes; full frames are what
//! `foundPairs.json` carries instead. The original source's
//! `get_all_from_port` exposed a caller-supplied order/limit fragment that
//! was spliced into SQL text and never could have executed correctly (§9) —
//! this module exposes a small closed set of typed queries instead, with
//! `ORDER BY` baked into each method's SQL.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::logging::tlog;
use crate::model::Pair;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS recent (
    uuid TEXT PRIMARY KEY,
    id INTEGER NOT NULL,
    call INTEGER NOT NULL,
    port TEXT NOT NULL,
    request TEXT NOT NULL,
    response TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recent_port ON recent (port);
CREATE INDEX IF NOT EXISTS idx_recent_port_id ON recent (port, id);
";

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub uuid: String,
    pub id: u8,
    pub call: u8,
    pub port: String,
    pub request: String,
    pub response: String,
    pub timestamp: chrono::DateTime<chrono::Local>,
}

pub struct RawStore {
    conn: Connection,
}

impl RawStore {
    /// Opens (creating if absent) the raw store database and applies the
    /// same WAL/performance pragmas the rest of this codebase's sqlite
    /// stores use.
    pub fn open(db_path: &Path) -> crate::error::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        tlog!("[raw_store] opened {}", db_path.display());
        Ok(Self { conn })
    }

    /// Insert-or-replace keyed on `pair.uuid()`. Stores the request/response
    /// *payload* only (slave+fc header and trailing CRC trimmed off both
    /// sides) — the full frame is what `foundPairs.json` gets instead.
    pub fn insert(&self, pair: &Pair) -> crate::error::Result<()> {
        let request_payload = if pair.request.len() >= 4 {
            &pair.request[2..pair.request.len() - 2]
        } else {
            &pair.request[..]
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO recent (uuid, id, call, port, request, response, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pair.uuid(),
                pair.slave,
                pair.function,
                pair.port,
                hex::encode_upper(request_payload),
                hex::encode_upper(pair.response_payload()),
                pair.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_with_uuid(&self, uuid: &str) -> crate::error::Result<Option<RawRow>> {
        self.conn
            .query_row(
                "SELECT uuid, id, call, port, request, response, timestamp FROM recent WHERE uuid = ?1",
                params![uuid],
                row_to_raw_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_all(&self) -> crate::error::Result<Vec<RawRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, id, call, port, request, response, timestamp FROM recent ORDER BY timestamp DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_raw_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// `id` here is the slave id (0-255 inclusive on the wire).
    pub fn get_all_for_port_and_slave(
        &self,
        port: &str,
        slave: u8,
    ) -> crate::error::Result<Vec<RawRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, id, call, port, request, response, timestamp FROM recent
             WHERE port = ?1 AND id = ?2 ORDER BY timestamp DESC",
        )?;
        let rows = stmt
            .query_map(params![port, slave], row_to_raw_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_raw_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    let id: i64 = row.get("id")?;
    let call: i64 = row.get("call")?;
    let timestamp: String = row.get("timestamp")?;
    Ok(RawRow {
        uuid: row.get("uuid")?,
        id: id as u8,
        call: call as u8,
        port: row.get("port")?,
        request: row.get("request")?,
        response: row.get("response")?,
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&chrono::Local))
            .unwrap_or_else(|_| chrono::Local::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pair(uuid_salt: u8) -> Pair {
        Pair::new(
            "/dev/ttyUSB0",
            vec![uuid_salt, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
            vec![uuid_salt, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0xFA, 0x9D],
            chrono::Local::now(),
        )
    }

    #[test]
    fn insert_or_replace_keeps_only_the_latest_row_per_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let store = RawStore::open(&dir.path().join("raw.db")).unwrap();
        let pair = sample_pair(1);
        store.insert(&pair).unwrap();
        store.insert(&pair).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);

        let row = store.get_with_uuid(&pair.uuid()).unwrap().unwrap();
        assert_eq!(row.port, "/dev/ttyUSB0");
        assert_eq!(row.id, 1);
    }

    #[test]
    fn get_all_for_port_and_slave_filters_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let store = RawStore::open(&dir.path().join("raw.db")).unwrap();
        store.insert(&sample_pair(1)).unwrap();
        store.insert(&sample_pair(2)).unwrap();

        let rows = store
            .get_all_for_port_and_slave("/dev/ttyUSB0", 1)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
    }

    #[test]
    fn missing_uuid_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RawStore::open(&dir.path().join("raw.db")).unwrap();
        assert!(store.get_with_uuid("does-not-exist").unwrap().is_none());
    }
}
