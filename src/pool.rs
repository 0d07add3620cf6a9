//! Bounded concurrent lookup of planned batches.
//!
//! Every batch gets its own task up front; a shared semaphore caps how many
//! of them talk to the network at once. A single cancellation token is
//! checked at each suspension point so a fatal error stops the whole pool.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregate::{Aggregator, RunOutcome};
use crate::batch::IdentifierBatch;
use crate::error::{CrawlError, Result};
use crate::lookup::{Disposition, LookupApi, Record};
use crate::progress::Progress;

/// Pause between retries of a batch that hit a transient transport error.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Used when the platform gives no open-file limit.
const FALLBACK_CONCURRENCY: usize = 256;

/// Soft limit on open file descriptors for this process.
#[cfg(unix)]
pub fn file_descriptor_limit() -> std::io::Result<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit for the duration of the call.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let soft = usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX);
    Ok(soft.clamp(1, Semaphore::MAX_PERMITS))
}

#[cfg(not(unix))]
pub fn file_descriptor_limit() -> std::io::Result<usize> {
    Ok(FALLBACK_CONCURRENCY)
}

/// Concurrency ceiling for a run: explicit override, else the fd limit.
pub fn concurrency_limit(requested: Option<usize>) -> usize {
    if let Some(n) = requested {
        return n.clamp(1, Semaphore::MAX_PERMITS);
    }
    match file_descriptor_limit() {
        Ok(n) => n,
        Err(e) => {
            warn!(
                "Could not read open file limit ({}), using {}",
                e, FALLBACK_CONCURRENCY
            );
            FALLBACK_CONCURRENCY
        }
    }
}

#[derive(Debug)]
enum BatchOutcome {
    Found(Vec<Record>),
    Empty,
    Abandoned,
    Fatal(CrawlError),
}

pub struct WorkerPool<L: ?Sized> {
    api: Arc<L>,
    limiter: Arc<Semaphore>,
    backoff: Duration,
    shutdown: CancellationToken,
}

impl<L: LookupApi + ?Sized + 'static> WorkerPool<L> {
    pub fn new(api: Arc<L>, limiter: Arc<Semaphore>, backoff: Duration) -> Self {
        Self {
            api,
            limiter,
            backoff,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every current and future run of this pool. Batches
    /// still outstanding when it fires count as abandoned.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Look up every batch and wait until all of them are accounted for.
    ///
    /// A fatal error does not make this return early: it cancels the run,
    /// waits for in-flight workers to abandon, and comes back in
    /// [`RunOutcome::fatal`].
    pub async fn run(&self, batches: &[IdentifierBatch], progress: &Progress) -> Result<RunOutcome> {
        let cancel = self.shutdown.child_token();
        let (reporter, aggregator) = Aggregator::new(batches.len(), cancel.clone());

        let mut workers = FuturesUnordered::new();
        for batch in batches.iter().cloned() {
            let api = self.api.clone();
            let limiter = self.limiter.clone();
            let cancel = cancel.clone();
            let reporter = reporter.clone();
            let progress = progress.clone();
            let backoff = self.backoff;

            workers.push(tokio::spawn(async move {
                let outcome = lookup_with_retry(&*api, &batch, &limiter, &cancel, backoff).await;
                progress.on_batch_complete();
                match outcome {
                    BatchOutcome::Found(records) => reporter.found(records),
                    BatchOutcome::Empty => reporter.empty(batch),
                    BatchOutcome::Fatal(e) => reporter.fatal(e),
                    BatchOutcome::Abandoned => {
                        debug!("Abandoned {} after cancellation", batch);
                        return true;
                    }
                }
                false
            }));
        }
        drop(reporter);

        let mut abandoned = 0;
        while let Some(joined) = workers.next().await {
            match joined {
                Ok(true) => abandoned += 1,
                Ok(false) => {}
                Err(e) => {
                    cancel.cancel();
                    while workers.next().await.is_some() {}
                    return Err(e.into());
                }
            }
        }

        aggregator.finish(abandoned).await
    }
}

async fn lookup_with_retry<L: LookupApi + ?Sized>(
    api: &L,
    batch: &IdentifierBatch,
    limiter: &Semaphore,
    cancel: &CancellationToken,
    backoff: Duration,
) -> BatchOutcome {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return BatchOutcome::Abandoned,
        permit = limiter.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => return BatchOutcome::Abandoned,
        },
    };

    loop {
        if cancel.is_cancelled() {
            return BatchOutcome::Abandoned;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return BatchOutcome::Abandoned,
            result = api.lookup_batch(batch.ids()) => result,
        };

        let err = match result {
            Ok(records) if records.is_empty() => return BatchOutcome::Empty,
            Ok(records) => return BatchOutcome::Found(records),
            Err(e) => e,
        };

        match err.disposition() {
            Disposition::Empty => return BatchOutcome::Empty,
            Disposition::Retry => {
                // TODO: add jitter or a retry ceiling; every worker currently
                // retries a struggling endpoint in lockstep, forever.
                debug!("Retrying {} in {:?}: {}", batch, backoff, err);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return BatchOutcome::Abandoned,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Disposition::QuotaExhausted | Disposition::Fatal => {
                debug!("Lookup of {} failed: {}", batch, err);
                return BatchOutcome::Fatal(err.into());
            }
        }
    }
}
