use std::fmt;

use tracing::debug;

use crate::checkpoint::CheckpointStore;
use crate::error::{CrawlError, Result};

/// Number of identifiers resolved by one lookup call.
pub const BATCH_SIZE: usize = 100;

/// An immutable group of identifiers submitted in one lookup call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierBatch {
    ids: Vec<i64>,
}

impl IdentifierBatch {
    /// The batch `[offset + 1 ..= offset + BATCH_SIZE]`, or `None` if that
    /// range runs past `i64::MAX`.
    pub fn sequential(offset: i64) -> Option<Self> {
        offset.checked_add(BATCH_SIZE as i64)?;
        let ids = (1..=BATCH_SIZE as i64).map(|i| offset + i).collect();
        Some(Self { ids })
    }

    /// Wrap previously stored identifiers. At most `BATCH_SIZE` are kept.
    pub fn from_ids(mut ids: Vec<i64>) -> Self {
        ids.truncate(BATCH_SIZE);
        Self { ids }
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn first(&self) -> Option<i64> {
        self.ids.first().copied()
    }

    pub fn last(&self) -> Option<i64> {
        self.ids.last().copied()
    }

    /// Highest identifier in the batch, which differs from `last` only for
    /// unsorted stored sequences.
    pub fn max_id(&self) -> Option<i64> {
        self.ids.iter().copied().max()
    }
}

impl fmt::Display for IdentifierBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => write!(f, "{first}..{last}"),
            _ => f.write_str("(empty)"),
        }
    }
}

/// Plan `count` batches from the checkpoint store.
///
/// Fewer batches come back only when the store runs dry; none at all aborts
/// the run instead of committing a no-op.
pub fn plan(store: &mut CheckpointStore, count: usize) -> Result<Vec<IdentifierBatch>> {
    let batches: Vec<_> = store
        .get_batches(count)?
        .into_iter()
        .filter(|b| !b.is_empty())
        .collect();
    if batches.is_empty() {
        return Err(CrawlError::NothingToPlan);
    }
    debug!("Planned {} of {} requested batches", batches.len(), count);
    Ok(batches)
}
