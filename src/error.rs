//! Error taxonomy shared by the shard store, aggregation engine and backup layer

use std::path::PathBuf;
use thiserror::Error;

/// Errors from reading a single shard
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("shard {path:?} is unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("file name {0:?} does not encode a shard window")]
    InvalidName(String),
}

/// Errors from one aggregation pass
#[derive(Debug, Error)]
pub enum AggregateError {
    /// Zero shards (or zero samples) could be read; prior artifacts are untouched
    #[error("no data available: {shards_seen} shards found, none readable")]
    NoDataAvailable { shards_seen: usize },
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {artifact}: {source}")]
    Serialize {
        artifact: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("aggregation task aborted: {0}")]
    Join(String),
}

/// Outcome classes of a provider operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network/timeout style failure; retryable by the caller
    #[error("transient failure: {0}")]
    Transient(String),
    /// Auth or missing-bucket style failure; the provider is unusable
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Permanent(_))
    }

    /// Map a local I/O error onto the provider taxonomy
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => ProviderError::NotFound(context.to_string()),
            ErrorKind::PermissionDenied => {
                ProviderError::Permanent(format!("{}: {}", context, err))
            }
            _ => ProviderError::Transient(format!("{}: {}", context, err)),
        }
    }
}

/// Errors that abort a whole backup run before any upload
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backups are disabled")]
    Disabled,
    #[error("no backup providers available")]
    NoProvidersAvailable,
    #[error("failed to enumerate backup files: {0}")]
    Enumerate(String),
    #[error("sync database error: {0}")]
    SyncDb(String),
    #[error("failed to serialize manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_to_provider_classes() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            ProviderError::from_io("a/b.csv", &missing),
            ProviderError::NotFound(_)
        ));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(ProviderError::from_io("a/b.csv", &denied).is_permanent());

        let flaky = std::io::Error::new(std::io::ErrorKind::Interrupted, "again");
        assert!(matches!(
            ProviderError::from_io("a/b.csv", &flaky),
            ProviderError::Transient(_)
        ));
    }
}
