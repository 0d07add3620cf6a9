//! Error types for the crawl engine.

use thiserror::Error;

use crate::lookup::LookupError;

pub type Result<T> = std::result::Result<T, CrawlError>;

/// Errors that abort a crawl run.
///
/// Anything that reaches the caller as a `CrawlError` is fatal for the run:
/// the checkpoint is left untouched and the next run repeats the same range.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Missing credential: set {0}")]
    MissingCredential(&'static str),
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Rate limit exceeded: {0}")]
    QuotaExhausted(String),
    #[error("Lookup failed: {0}")]
    Lookup(LookupError),
    #[error("Nothing left to re-fetch")]
    NothingToPlan,
    #[error("Identifier space exhausted after checkpoint {0}")]
    IdSpaceExhausted(i64),
    #[error("Re-fetch source {0} is one of the partition databases")]
    RefetchFromPartition(std::path::PathBuf),
    #[error("{0} batches did not complete")]
    Incomplete(usize),
    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl From<LookupError> for CrawlError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::Api { code, message } if code == crate::lookup::CODE_RATE_LIMITED => {
                CrawlError::QuotaExhausted(format!("code {code}: {message}"))
            }
            other => CrawlError::Lookup(other),
        }
    }
}
