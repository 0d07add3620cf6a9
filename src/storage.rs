//! Per-year sqlite partitions for discovered records.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lookup::Record;

/// Open (creating if needed) a database holding the `user` table.
pub fn open_user_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user (id INTEGER PRIMARY KEY NOT NULL, created_at timestamp)",
    )?;
    Ok(conn)
}

/// Destination for records found during a run.
pub trait RecordSink {
    /// Insert or replace `records` in `partition`, keyed by id.
    fn bulk_upsert(&self, partition: i32, records: &[Record]) -> Result<()>;
}

/// One sqlite file per calendar year, `<dir>/<year>.db`.
#[derive(Debug, Clone)]
pub struct PartitionedSqlite {
    dir: PathBuf,
}

impl PartitionedSqlite {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn partition_path(&self, partition: i32) -> PathBuf {
        self.dir.join(format!("{partition}.db"))
    }

    /// Partition keys with a database file on disk, ascending.
    pub fn partitions(&self) -> Result<Vec<i32>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<i32>) {
                Some(Ok(key)) => keys.push(key),
                _ => debug!("Skipping non-partition file {}", path.display()),
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    /// All records stored in one partition, ordered by id.
    pub fn records(&self, partition: i32) -> Result<Vec<Record>> {
        let conn = open_user_db(&self.partition_path(partition))?;
        let mut stmt = conn.prepare("SELECT id, created_at FROM user ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, secs) in rows {
            match DateTime::from_timestamp(secs, 0) {
                Some(created_at) => records.push(Record::new(id, created_at)),
                None => warn!("Skipping id {} with invalid timestamp {}", id, secs),
            }
        }
        Ok(records)
    }
}

impl RecordSink for PartitionedSqlite {
    fn bulk_upsert(&self, partition: i32, records: &[Record]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut conn = open_user_db(&self.partition_path(partition))?;

        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO user (id, created_at) VALUES (?1, ?2)")?;
            for record in records {
                stmt.execute(params![record.id, record.created_at.timestamp()])?;
            }
        }
        tx.commit()?;

        debug!("Upserted {} records into {}", records.len(), partition);
        Ok(())
    }
}

/// Dump every partition into one CSV file.
pub fn export_csv(store: &PartitionedSqlite, out: &Path) -> Result<usize> {
    let mut writer = csv::Writer::from_path(out)?;
    writer.write_record(["id", "created_at", "partition"])?;

    let mut written = 0;
    for partition in store.partitions()? {
        for record in store.records(partition)? {
            writer.write_record([
                record.id.to_string(),
                record.created_at.to_rfc3339(),
                partition.to_string(),
            ])?;
            written += 1;
        }
    }
    writer.flush()?;

    info!("Exported {} records to {}", written, out.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn user_table_schema() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_user_db(&dir.path().join("schema.db")).unwrap();
        let mut stmt = conn.prepare("PRAGMA table_info(user)").unwrap();
        let cols = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert!(cols.contains(&("id".to_string(), "INTEGER".to_string(), 1, 1)));
        assert!(cols.contains(&("created_at".to_string(), "timestamp".to_string(), 0, 0)));
    }

    #[test]
    fn upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionedSqlite::new(dir.path().join("db"));
        let at = Utc.with_ymd_and_hms(2012, 3, 4, 5, 6, 7).unwrap();
        let records = vec![Record::new(5, at), Record::new(9, at)];

        store.bulk_upsert(2012, &records).unwrap();
        store.bulk_upsert(2012, &records).unwrap();

        assert_eq!(store.partitions().unwrap(), vec![2012]);
        assert_eq!(store.records(2012).unwrap(), records);
    }

    #[test]
    fn exports_all_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionedSqlite::new(dir.path().join("db"));
        store
            .bulk_upsert(
                2009,
                &[Record::new(1, Utc.with_ymd_and_hms(2009, 1, 1, 0, 0, 0).unwrap())],
            )
            .unwrap();
        store
            .bulk_upsert(
                2015,
                &[Record::new(2, Utc.with_ymd_and_hms(2015, 6, 1, 0, 0, 0).unwrap())],
            )
            .unwrap();

        let out = dir.path().join("users.csv");
        assert_eq!(export_csv(&store, &out).unwrap(), 2);

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "id,created_at,partition");
        assert_eq!(lines[1], "1,2009-01-01T00:00:00+00:00,2009");
        assert_eq!(lines[2], "2,2015-06-01T00:00:00+00:00,2015");
    }
}
