use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::CheckpointSource;
use crate::error::{CrawlError, Result};
use crate::pool::RETRY_BACKOFF;
use crate::progress::ProgressMode;

/// A user access token pair for request signing.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub secret: String,
}

/// API credentials.
///
/// An access token pair, when present, signs every request in user context.
/// Otherwise the client falls back to app-only auth, where a bearer token, if
/// present, skips the token exchange.
#[derive(Clone)]
pub struct Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access: Option<AccessToken>,
    pub bearer_token: Option<String>,
}

impl Credentials {
    /// Build credentials from optional values, as read from the command line
    /// or its `TW_*` environment fallbacks. Empty strings count as unset.
    pub fn new(consumer_key: Option<String>, consumer_secret: Option<String>) -> Result<Self> {
        Ok(Self {
            consumer_key: required(consumer_key, "TW_CONSUMER_KEY")?,
            consumer_secret: required(consumer_secret, "TW_CONSUMER_SECRET")?,
            access: None,
            bearer_token: None,
        })
    }

    /// Add a user access token pair. Half a pair is an error.
    pub fn with_access_token(mut self, token: Option<String>, secret: Option<String>) -> Result<Self> {
        self.access = match (non_empty(token), non_empty(secret)) {
            (Some(token), Some(secret)) => Some(AccessToken { token, secret }),
            (None, None) => None,
            (Some(_), None) => return Err(CrawlError::MissingCredential("TW_ACCESS_SECRET")),
            (None, Some(_)) => return Err(CrawlError::MissingCredential("TW_ACCESS_TOKEN")),
        };
        Ok(self)
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = non_empty(token);
        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn required(value: Option<String>, name: &'static str) -> Result<String> {
    non_empty(value).ok_or(CrawlError::MissingCredential(name))
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("access", &self.access)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &self.token)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Resolved settings for one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub checkpoint: CheckpointSource,
    /// Directory holding one database per partition year.
    pub partition_dir: PathBuf,
    /// Overrides the open-file limit as the concurrency ceiling.
    pub concurrency: Option<usize>,
    pub retry_backoff: Duration,
    pub progress: ProgressMode,
}

impl CrawlConfig {
    pub fn new(checkpoint: CheckpointSource) -> Self {
        Self {
            checkpoint,
            partition_dir: PathBuf::from("db"),
            concurrency: None,
            retry_backoff: RETRY_BACKOFF,
            progress: ProgressMode::default(),
        }
    }

    /// Reject a re-fetch source that is one of this run's own partition
    /// databases: committing would upsert into it and then delete from it.
    pub fn validate(&self) -> Result<()> {
        if let CheckpointSource::Relational { path } = &self.checkpoint {
            if is_partition_file(path, &self.partition_dir) {
                return Err(CrawlError::RefetchFromPartition(path.clone()));
            }
        }
        Ok(())
    }
}

/// Whether `path` names a `<year>.db` file directly inside `dir`.
fn is_partition_file(path: &Path, dir: &Path) -> bool {
    let is_db = path.extension().and_then(|e| e.to_str()) == Some("db");
    let is_year = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.parse::<i32>().is_ok());
    if !is_db || !is_year {
        return false;
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), dir.canonicalize()) {
        (Ok(parent), Ok(dir)) => parent == dir,
        _ => parent == dir,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_consumer_key_names_the_variable() {
        let err = Credentials::new(Some(String::new()), Some("secret".into())).unwrap_err();
        assert!(matches!(err, CrawlError::MissingCredential("TW_CONSUMER_KEY")));
    }

    #[test]
    fn access_token_needs_both_halves() {
        let creds = || Credentials::new(Some("key".into()), Some("secret".into())).unwrap();

        let err = creds()
            .with_access_token(Some("token".into()), None)
            .unwrap_err();
        assert!(matches!(err, CrawlError::MissingCredential("TW_ACCESS_SECRET")));

        let full = creds()
            .with_access_token(Some("token".into()), Some("token-secret".into()))
            .unwrap();
        assert_eq!(full.access.as_ref().map(|a| a.token.as_str()), Some("token"));
        assert!(!format!("{full:?}").contains("token-secret"));

        let app_only = creds().with_access_token(None, Some(String::new())).unwrap();
        assert!(app_only.access.is_none());
    }

    #[test]
    fn refetch_from_partition_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let partitions = dir.path().join("db");
        std::fs::create_dir_all(&partitions).unwrap();

        let mut config = CrawlConfig::new(CheckpointSource::Relational {
            path: dir.path().join("db").join("..").join("db").join("2019.db"),
        });
        config.partition_dir = partitions.clone();
        assert!(matches!(config.validate(), Err(CrawlError::RefetchFromPartition(_))));

        config.checkpoint = CheckpointSource::Relational {
            path: dir.path().join("twitter.db"),
        };
        assert!(config.validate().is_ok());

        config.checkpoint = CheckpointSource::Relational {
            path: partitions.join("backup.db"),
        };
        assert!(config.validate().is_ok());
    }
}
