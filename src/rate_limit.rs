use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{CrawlError, Result};
use crate::lookup::{Disposition, LookupApi, RateLimitStatus};

/// Decides how many batches a run may attempt.
#[derive(Debug, Clone)]
pub struct RateLimitGate {
    backoff: Duration,
}

impl RateLimitGate {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Number of batches the server currently allows.
    ///
    /// With no quota left the whole run waits for the reset once and asks
    /// again; still having nothing after that is fatal.
    pub async fn resolve<L: LookupApi + ?Sized>(&self, api: &L) -> Result<usize> {
        let status = self.status(api).await?;
        if status.remaining > 0 {
            info!("Rate limit allows {} lookups", status.remaining);
            return Ok(status.remaining);
        }

        let wait = (status.reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        info!("Wait to reset rate limit: {:?}", wait);
        tokio::time::sleep(wait).await;

        let status = self.status(api).await?;
        if status.remaining == 0 {
            return Err(CrawlError::QuotaExhausted(format!(
                "no lookups available after reset at {}",
                status.reset_at
            )));
        }
        info!("Rate limit reset, {} lookups available", status.remaining);
        Ok(status.remaining)
    }

    async fn status<L: LookupApi + ?Sized>(&self, api: &L) -> Result<RateLimitStatus> {
        loop {
            match api.check_rate_limit().await {
                Ok(status) => {
                    debug!(
                        "Rate limit status: {} remaining, reset at {}",
                        status.remaining, status.reset_at
                    );
                    return Ok(status);
                }
                Err(e) if e.disposition() == Disposition::Retry => {
                    warn!("Rate limit check failed, retrying: {}", e);
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
