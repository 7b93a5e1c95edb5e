//! SQLite-backed storage for decoded measures. One row per
//! (device_daq, measure_name), latest-wins.

use rusqlite::{params, Connection};
use std::path::Path;

use crate::decoder::Measure;
use crate::logging::tlog;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS measures (
    device_daq TEXT NOT NULL,
    measure_name TEXT NOT NULL,
    value REAL NOT NULL,
    last_updated TEXT NOT NULL,
    PRIMARY KEY (device_daq, measure_name)
);
";

#[derive(Debug, Clone, PartialEq)]
pub struct MeasureRow {
    pub device_daq: String,
    pub measure_name: String,
    pub value: f64,
    pub last_updated: chrono::DateTime<chrono::Local>,
}

pub struct MeasureStore {
    conn: Connection,
}

impl MeasureStore {
    pub fn open(db_path: &Path) -> crate::error::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        tlog!("[measure_store] opened {}", db_path.display());
        Ok(Self { conn })
    }

    pub fn insert(
        &self,
        measure: &Measure,
        now: chrono::DateTime<chrono::Local>,
    ) -> crate::error::Result<()> {
        self.conn.execute(
            "INSERT INTO measures (device_daq, measure_name, value, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_daq, measure_name)
             DO UPDATE SET value = excluded.value, last_updated = excluded.last_updated",
            params![
                measure.device_daq,
                measure.measure_name,
                measure.value,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_with_daq(&self, device_daq: &str) -> crate::error::Result<Vec<MeasureRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_daq, measure_name, value, last_updated FROM measures WHERE device_daq = ?1",
        )?;
        let rows = stmt
            .query_map(params![device_daq], row_to_measure)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_measure(row: &rusqlite::Row) -> rusqlite::Result<MeasureRow> {
    let last_updated: String = row.get("last_updated")?;
    Ok(MeasureRow {
        device_daq: row.get("device_daq")?,
        measure_name: row.get("measure_name")?,
        value: row.get("value")?,
        last_updated: chrono::DateTime::parse_from_rfc3339(&last_updated)
            .map(|dt| dt.with_timezone(&chrono::Local))
            .unwrap_or_else(|_| chrono::Local::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_write_wins_per_device_and_measure() {
        let dir = tempfile::tempdir().unwrap();
        let store = MeasureStore::open(&dir.path().join("measures.db")).unwrap();
        let measure = Measure {
            device_daq: "inv-1".into(),
            measure_name: "voltage".into(),
            value: 230.0,
        };
        store.insert(&measure, chrono::Local::now()).unwrap();
        let updated = Measure {
            value: 231.5,
            ..measure.clone()
        };
        store.insert(&updated, chrono::Local::now()).unwrap();

        let rows = store.get_with_daq("inv-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 231.5);
    }
}
