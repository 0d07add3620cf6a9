//! Resumable enumeration of a dense account-ID space against a rate-limited
//! lookup API.
//!
//! A run reads the checkpoint, asks the API how many lookups it may make,
//! resolves that many batches of 100 identifiers concurrently, stores what it
//! found in per-year partitions and only then advances the checkpoint.

pub mod aggregate;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod error;
pub mod lookup;
pub mod oauth;
pub mod pool;
pub mod progress;
pub mod rate_limit;
pub mod storage;
pub mod twitter;

pub use aggregate::{PartitionedResults, RunOutcome};
pub use batch::{BATCH_SIZE, IdentifierBatch};
pub use checkpoint::{CheckpointSource, CheckpointStore};
pub use config::{AccessToken, CrawlConfig, Credentials};
pub use crawler::{Crawler, RunReport};
pub use error::{CrawlError, Result};
pub use lookup::{LookupApi, LookupError, RateLimitStatus, Record};
pub use progress::ProgressMode;
pub use storage::{PartitionedSqlite, RecordSink};
pub use twitter::TwitterClient;
