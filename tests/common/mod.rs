#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use id_crawler::lookup::CODE_RATE_LIMITED;
use id_crawler::{
    CheckpointSource, CrawlConfig, LookupApi, LookupError, ProgressMode, RateLimitStatus, Record,
};

/// In-process lookup API answering from a script keyed by batch start id.
#[derive(Default)]
pub struct ScriptedApi {
    statuses: Mutex<VecDeque<RateLimitStatus>>,
    responses: Mutex<HashMap<i64, VecDeque<Result<Vec<Record>, LookupError>>>>,
    failing: Mutex<HashMap<i64, LookupError>>,
    slow: Mutex<HashMap<i64, Duration>>,
    delay: Duration,
    pub status_checks: AtomicUsize,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    quota_hit: AtomicBool,
    pub calls_after_quota: AtomicUsize,
}

impl ScriptedApi {
    pub fn with_remaining(remaining: usize) -> Self {
        let api = Self::default();
        api.push_status(remaining, Utc::now());
        api
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_status(&self, remaining: usize, reset_at: chrono::DateTime<Utc>) {
        self.statuses.lock().unwrap().push_back(RateLimitStatus {
            remaining,
            reset_at,
        });
    }

    /// Queue a response for the batch starting at `first_id`. Unscripted
    /// calls find nothing.
    pub fn respond(&self, first_id: i64, response: Result<Vec<Record>, LookupError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(first_id)
            .or_default()
            .push_back(response);
    }

    /// Delay lookups of the batch starting at `first_id` by `delay` instead
    /// of the default.
    pub fn slow(&self, first_id: i64, delay: Duration) {
        self.slow.lock().unwrap().insert(first_id, delay);
    }

    /// Make every lookup of the batch starting at `first_id` fail with `err`.
    pub fn fail_always(&self, first_id: i64, err: LookupError) {
        self.failing.lock().unwrap().insert(first_id, err);
    }

    fn next_response(&self, first_id: i64) -> Result<Vec<Record>, LookupError> {
        if let Some(err) = self.failing.lock().unwrap().get(&first_id) {
            return Err(err.clone());
        }
        self.responses
            .lock()
            .unwrap()
            .get_mut(&first_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl LookupApi for ScriptedApi {
    async fn check_rate_limit(&self) -> Result<RateLimitStatus, LookupError> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        status.ok_or_else(|| LookupError::Transport("no status scripted".into()))
    }

    async fn lookup_batch(&self, ids: &[i64]) -> Result<Vec<Record>, LookupError> {
        if self.quota_hit.load(Ordering::SeqCst) {
            self.calls_after_quota.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .slow
            .lock()
            .unwrap()
            .get(&ids[0])
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let response = self.next_response(ids[0]);
        if matches!(&response, Err(LookupError::Api { code, .. }) if *code == CODE_RATE_LIMITED) {
            self.quota_hit.store(true, Ordering::SeqCst);
        }
        response
    }
}

pub fn record(id: i64, year: i32) -> Record {
    Record::new(id, Utc.with_ymd_and_hms(year, 7, 1, 12, 0, 0).unwrap())
}

pub fn quota_error() -> LookupError {
    LookupError::Api {
        code: CODE_RATE_LIMITED,
        message: "Rate limit exceeded".into(),
    }
}

pub fn file_source(dir: &Path) -> CheckpointSource {
    CheckpointSource::File {
        path: dir.join("offset.bin"),
        legacy_db: None,
    }
}

pub fn test_config(dir: &Path, checkpoint: CheckpointSource) -> CrawlConfig {
    let mut config = CrawlConfig::new(checkpoint);
    config.partition_dir = dir.join("db");
    config.concurrency = Some(8);
    config.retry_backoff = Duration::from_millis(1);
    config.progress = ProgressMode::Hidden;
    config
}

/// Offset stored in the checkpoint file, or `None` if never written.
pub fn stored_offset(dir: &Path) -> Option<i64> {
    let bytes = std::fs::read(dir.join("offset.bin")).ok()?;
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_le_bytes(raw))
}
