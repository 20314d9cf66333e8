//! spread-vault
//!
//! Merges rotating market-data shards into one indicator-annotated series and
//! keeps shards and derived artifacts recoverable through pluggable backup
//! providers.

pub mod aggregate;
pub mod backup;
pub mod config;
pub mod error;
pub mod health;
pub mod recovery;
pub mod scheduler;
pub mod server;
pub mod shard;

pub use aggregate::{AggregationEngine, AggregationReport, HistoricalSeries, Metadata, ResampledPoint};
pub use backup::{BackupOrchestrator, BackupProvider, ProviderRegistry};
pub use config::Config;
pub use error::{AggregateError, BackupError, ProviderError, ShardError};
pub use recovery::{RecoveryCoordinator, RecoveryReport};
pub use shard::{Sample, ShardInfo, ShardStore};

/// Result of a single-run operation that may be coalesced into an in-flight run
#[derive(Debug, Clone)]
pub enum RunOutcome<T> {
    Completed(T),
    /// Another run was already in progress and will cover this trigger
    Coalesced,
}

impl<T> RunOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            RunOutcome::Coalesced => None,
        }
    }

    pub fn is_coalesced(&self) -> bool {
        matches!(self, RunOutcome::Coalesced)
    }
}
