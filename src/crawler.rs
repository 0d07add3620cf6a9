//! One crawl run, from checkpoint to checkpoint.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregate::PartitionedResults;
use crate::batch::{self, IdentifierBatch};
use crate::checkpoint::CheckpointStore;
use crate::config::CrawlConfig;
use crate::error::{CrawlError, Result};
use crate::lookup::LookupApi;
use crate::pool::{self, WorkerPool};
use crate::progress::{Progress, ProgressMode};
use crate::rate_limit::RateLimitGate;
use crate::storage::RecordSink;

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub planned: usize,
    pub found: usize,
    pub empty: usize,
    pub partitions: Vec<i32>,
    pub checkpoint: i64,
}

pub struct Crawler<L: ?Sized, S> {
    api: Arc<L>,
    store: CheckpointStore,
    sink: S,
    gate: RateLimitGate,
    pool: WorkerPool<L>,
    progress: ProgressMode,
}

impl<L, S> Crawler<L, S>
where
    L: LookupApi + ?Sized + 'static,
    S: RecordSink,
{
    pub fn new(
        api: Arc<L>,
        store: CheckpointStore,
        sink: S,
        config: &CrawlConfig,
    ) -> Result<Self> {
        config.validate()?;
        let limit = pool::concurrency_limit(config.concurrency);
        info!("Running up to {} lookups concurrently", limit);
        let limiter = Arc::new(Semaphore::new(limit));
        Ok(Self {
            pool: WorkerPool::new(api.clone(), limiter, config.retry_backoff),
            gate: RateLimitGate::new(config.retry_backoff),
            api,
            store,
            sink,
            progress: config.progress,
        })
    }

    /// Crawl as many batches as the quota allows and advance the checkpoint.
    ///
    /// On error nothing is stored and the checkpoint is left where it was.
    pub async fn run(&mut self) -> Result<RunReport> {
        let allowed = self.gate.resolve(&*self.api).await?;
        let batches = batch::plan(&mut self.store, allowed)?;
        if let (Some(first), Some(last)) = (batches.first(), batches.last()) {
            info!(
                "Looking up {} batches from {} to {}",
                batches.len(),
                first.first().unwrap_or_default(),
                last.last().unwrap_or_default()
            );
        }

        let progress = Progress::start(self.progress, batches.len());
        let outcome = self.pool.run(&batches, &progress).await?;
        progress.on_finish(&outcome.batches_empty);

        if let Some(err) = outcome.fatal {
            return Err(err);
        }
        if outcome.batches_abandoned > 0 {
            return Err(CrawlError::Incomplete(outcome.batches_abandoned));
        }

        let partitions = outcome.partition();
        let found: usize = partitions.values().map(Vec::len).sum();
        if found == 0 {
            info!("Not found user IDs");
        } else {
            info!("Found {} user IDs", found);
        }

        let checkpoint = commit(&mut self.store, &self.sink, &batches, &partitions)?;
        Ok(RunReport {
            planned: batches.len(),
            found,
            empty: outcome.batches_empty.len(),
            partitions: partitions.keys().copied().collect(),
            checkpoint,
        })
    }

    /// Cancelling this token interrupts a run in progress. The interrupted
    /// run fails with [`CrawlError::Incomplete`] and stores nothing.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.pool.shutdown_token()
    }

    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}

/// Persist found records, then advance the checkpoint past every planned
/// batch, including those that found nothing.
pub fn commit<S: RecordSink + ?Sized>(
    store: &mut CheckpointStore,
    sink: &S,
    planned: &[IdentifierBatch],
    partitions: &PartitionedResults,
) -> Result<i64> {
    for (partition, records) in partitions {
        sink.bulk_upsert(*partition, records)?;
    }

    let target = store
        .commit_target(planned)
        .ok_or(CrawlError::NothingToPlan)?;
    store.advance(target)?;
    info!("Checkpoint advanced to {}", target);
    Ok(target)
}
