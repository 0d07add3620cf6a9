//! Durable progress marker for the crawl.
//!
//! Two backends sit behind [`CheckpointStore`]:
//!
//! - a flat file holding the last fully accounted-for offset as 8 raw
//!   little-endian bytes, used for sequential enumeration;
//! - a sqlite `user` table of previously discovered identifiers, used in
//!   re-fetch mode, where advancing deletes everything already re-checked.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::batch::{IdentifierBatch, BATCH_SIZE};
use crate::error::{CrawlError, Result};
use crate::storage;

/// Where the checkpoint lives, decided once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
    /// Sequential mode. `legacy_db` optionally seeds a fresh checkpoint from
    /// the highest id recorded in an older single-file database.
    File {
        path: PathBuf,
        legacy_db: Option<PathBuf>,
    },
    /// Re-fetch mode over a database of previously discovered ids.
    Relational { path: PathBuf },
}

pub enum CheckpointStore {
    File(FileCheckpoint),
    Relational(RelationalCheckpoint),
}

impl CheckpointStore {
    pub fn open(source: &CheckpointSource) -> Result<Self> {
        match source {
            CheckpointSource::File { path, legacy_db } => Ok(CheckpointStore::File(
                FileCheckpoint::open(path, legacy_db.clone())?,
            )),
            CheckpointSource::Relational { path } => Ok(CheckpointStore::Relational(
                RelationalCheckpoint::open(path)?,
            )),
        }
    }

    /// Up to `max_batches` candidate batches following the checkpoint.
    pub fn get_batches(&mut self, max_batches: usize) -> Result<Vec<IdentifierBatch>> {
        match self {
            CheckpointStore::File(store) => store.get_batches(max_batches),
            CheckpointStore::Relational(store) => store.get_batches(max_batches),
        }
    }

    /// The value to commit once every planned batch has been accounted for.
    pub fn commit_target(&self, planned: &[IdentifierBatch]) -> Option<i64> {
        match self {
            CheckpointStore::File(_) => planned.last().and_then(IdentifierBatch::last),
            CheckpointStore::Relational(_) => {
                planned.iter().filter_map(IdentifierBatch::max_id).max()
            }
        }
    }

    pub fn advance(&mut self, last: i64) -> Result<()> {
        match self {
            CheckpointStore::File(store) => store.advance(last),
            CheckpointStore::Relational(store) => store.advance(last),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            CheckpointStore::File(store) => store.close(),
            CheckpointStore::Relational(store) => store.close(),
        }
    }
}

pub struct FileCheckpoint {
    file: File,
    legacy_db: Option<PathBuf>,
}

impl FileCheckpoint {
    pub fn open(path: &Path, legacy_db: Option<PathBuf>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file, legacy_db })
    }

    /// The stored offset, or the seed for a fresh install.
    pub fn offset(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.file.seek(SeekFrom::Start(0))?;
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(i64::from_le_bytes(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => self.seed(),
            Err(e) => Err(e.into()),
        }
    }

    fn seed(&self) -> Result<i64> {
        let Some(legacy) = &self.legacy_db else {
            debug!("No checkpoint recorded, starting from 0");
            return Ok(0);
        };
        if !legacy.exists() {
            warn!(
                "Legacy database {} not found, starting from 0",
                legacy.display()
            );
            return Ok(0);
        }
        let conn = Connection::open(legacy)?;
        let last: Option<i64> = conn
            .query_row("SELECT id FROM user ORDER BY id DESC LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        let offset = last.unwrap_or(0);
        info!(
            "Seeded checkpoint at {} from legacy database {}",
            offset,
            legacy.display()
        );
        Ok(offset)
    }

    fn get_batches(&mut self, max_batches: usize) -> Result<Vec<IdentifierBatch>> {
        let offset = self.offset()?;
        (0..max_batches as i64)
            .map(|i| {
                i.checked_mul(BATCH_SIZE as i64)
                    .and_then(|step| offset.checked_add(step))
                    .and_then(IdentifierBatch::sequential)
                    .ok_or(CrawlError::IdSpaceExhausted(offset))
            })
            .collect()
    }

    fn advance(&mut self, offset: i64) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&offset.to_le_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }

    fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

pub struct RelationalCheckpoint {
    conn: Connection,
}

impl RelationalCheckpoint {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: storage::open_user_db(path)?,
        })
    }

    fn get_batches(&mut self, max_batches: usize) -> Result<Vec<IdentifierBatch>> {
        let limit = (max_batches * BATCH_SIZE) as i64;
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM user ORDER BY id ASC LIMIT ?1")?;
        let ids = stmt
            .query_map(params![limit], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids
            .chunks(BATCH_SIZE)
            .map(|chunk| IdentifierBatch::from_ids(chunk.to_vec()))
            .collect())
    }

    fn advance(&mut self, last_id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM user WHERE id <= ?1", params![last_id])?;
        debug!("Removed {} re-fetched ids up to {}", deleted, last_id);
        Ok(())
    }

    fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| e)?;
        Ok(())
    }
}
