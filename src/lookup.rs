//! Contract between the crawl engine and the remote lookup API.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;

/// API error code for "no user matches for specified terms".
pub const CODE_NO_MATCHES: i64 = 17;
/// API error code for "rate limit exceeded".
pub const CODE_RATE_LIMITED: i64 = 88;

/// A discovered account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn new(id: i64, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at }
    }

    /// Partition key: the calendar year the record was created in.
    pub fn partition(&self) -> i32 {
        self.created_at.year()
    }
}

/// Quota remaining on the lookup endpoint and when it resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: usize,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error)]
pub enum LookupError {
    /// Timeouts and connection failures that are worth retrying as-is.
    #[error("Transient transport error: {0}")]
    Timeout(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// What a worker should do with a failed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Empty,
    QuotaExhausted,
    Fatal,
}

impl LookupError {
    pub fn disposition(&self) -> Disposition {
        match self {
            LookupError::Timeout(_) => Disposition::Retry,
            LookupError::Api { code, .. } if *code == CODE_NO_MATCHES => Disposition::Empty,
            LookupError::Api { code, .. } if *code == CODE_RATE_LIMITED => {
                Disposition::QuotaExhausted
            }
            _ => Disposition::Fatal,
        }
    }
}

/// Remote lookup operations the crawler depends on.
#[async_trait]
pub trait LookupApi: Send + Sync {
    async fn check_rate_limit(&self) -> Result<RateLimitStatus, LookupError>;

    /// Resolve a batch of identifiers. Unassigned identifiers are simply
    /// missing from the result.
    async fn lookup_batch(&self, ids: &[i64]) -> Result<Vec<Record>, LookupError>;
}
