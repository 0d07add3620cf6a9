//! Fan-in of worker outcomes.
//!
//! Workers report through a [`Reporter`]; the [`Aggregator`] owns the
//! receiving ends and a watcher task that holds on to the first fatal error.
//! Every channel is sized to the planned batch count and each worker sends at
//! most one message, so reporting never blocks.

use std::collections::{BTreeMap, HashSet};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::IdentifierBatch;
use crate::error::{CrawlError, Result};
use crate::lookup::Record;

/// Found records grouped by calendar year of creation.
pub type PartitionedResults = BTreeMap<i32, Vec<Record>>;

#[derive(Debug, Clone)]
pub struct Reporter {
    found: mpsc::Sender<Vec<Record>>,
    empty: mpsc::Sender<IdentifierBatch>,
    fatal: mpsc::Sender<CrawlError>,
    cancel: CancellationToken,
}

impl Reporter {
    pub fn found(&self, records: Vec<Record>) {
        if self.found.try_send(records).is_err() {
            debug!("Found channel closed, dropping records");
        }
    }

    pub fn empty(&self, batch: IdentifierBatch) {
        if self.empty.try_send(batch).is_err() {
            debug!("Empty channel closed, dropping batch");
        }
    }

    /// Report a fatal error. The run is cancelled before this returns, so no
    /// worker starts another lookup afterwards.
    pub fn fatal(&self, err: CrawlError) {
        self.cancel.cancel();
        let _ = self.fatal.try_send(err);
    }
}

pub struct Aggregator {
    found: mpsc::Receiver<Vec<Record>>,
    empty: mpsc::Receiver<IdentifierBatch>,
    watcher: JoinHandle<Option<CrawlError>>,
}

impl Aggregator {
    pub fn new(capacity: usize, cancel: CancellationToken) -> (Reporter, Aggregator) {
        let capacity = capacity.max(1);
        let (found_tx, found_rx) = mpsc::channel(capacity);
        let (empty_tx, empty_rx) = mpsc::channel(capacity);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<CrawlError>(capacity);

        let watch_cancel = cancel.clone();
        let watcher = tokio::spawn(async move {
            let first = fatal_rx.recv().await?;
            watch_cancel.cancel();
            debug!("Cancelling run: {}", first);
            let mut suppressed = 0usize;
            while fatal_rx.recv().await.is_some() {
                suppressed += 1;
            }
            if suppressed > 0 {
                debug!("Ignored {} errors reported after cancellation", suppressed);
            }
            Some(first)
        });

        let reporter = Reporter {
            found: found_tx,
            empty: empty_tx,
            fatal: fatal_tx,
            cancel,
        };
        let aggregator = Aggregator {
            found: found_rx,
            empty: empty_rx,
            watcher,
        };
        (reporter, aggregator)
    }

    /// Collect every outcome. Must be called once all reporters are dropped.
    pub async fn finish(mut self, batches_abandoned: usize) -> Result<RunOutcome> {
        let fatal = self.watcher.await?;

        let mut batches_succeeded = 0;
        let mut found = Vec::new();
        while let Some(records) = self.found.recv().await {
            batches_succeeded += 1;
            found.extend(records);
        }

        let mut batches_empty = Vec::new();
        while let Some(batch) = self.empty.recv().await {
            batches_empty.push(batch);
        }

        Ok(RunOutcome {
            batches_succeeded,
            batches_empty,
            batches_abandoned,
            found,
            fatal,
        })
    }
}

/// Everything one run produced.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub batches_succeeded: usize,
    pub batches_empty: Vec<IdentifierBatch>,
    pub batches_abandoned: usize,
    pub found: Vec<Record>,
    pub fatal: Option<CrawlError>,
}

impl RunOutcome {
    /// Group found records by partition, dropping duplicate ids.
    pub fn partition(&self) -> PartitionedResults {
        let mut seen = HashSet::new();
        let mut partitions = PartitionedResults::new();
        for record in &self.found {
            if seen.insert(record.id) {
                partitions
                    .entry(record.partition())
                    .or_default()
                    .push(*record);
            }
        }
        partitions
    }
}
