//! Process health flags
//!
//! Written by recovery, the freshness check and the aggregation loop; read by
//! the status endpoint. Reads never touch the filesystem.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Classification of the local data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalDataStatus {
    /// Data directory does not exist
    Missing,
    /// No shards and no artifacts
    Empty,
    /// historical.json exists but is too small to hold a series
    Incomplete,
    /// Newest data is older than the staleness threshold
    Stale,
    Healthy,
}

impl LocalDataStatus {
    pub fn needs_restore(self) -> bool {
        self != LocalDataStatus::Healthy
    }
}

/// Result of one freshness check
#[derive(Debug, Clone, Serialize)]
pub struct Freshness {
    pub status: LocalDataStatus,
    pub newest_modified: Option<DateTime<Utc>>,
    pub shard_count: usize,
    pub artifact_count: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    pub degraded: bool,
    pub reasons: Vec<String>,
    pub freshness: Option<Freshness>,
    pub restore_incomplete: Option<String>,
    pub no_providers: bool,
    pub last_aggregation_at: Option<DateTime<Utc>>,
    pub last_aggregation_error: Option<String>,
}

#[derive(Debug, Default)]
struct Flags {
    freshness: Option<Freshness>,
    restore_incomplete: Option<String>,
    no_providers: bool,
    last_aggregation_at: Option<DateTime<Utc>>,
    last_aggregation_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthState {
    flags: Arc<RwLock<Flags>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Healthy local data also clears a restore-incomplete flag left from an
    /// earlier recovery
    pub async fn set_freshness(&self, freshness: Freshness) {
        let mut flags = self.flags.write().await;
        if freshness.status == LocalDataStatus::Healthy {
            if let Some(reason) = flags.restore_incomplete.take() {
                info!("Local data healthy again, clearing restore flag ({})", reason);
            }
        }
        flags.freshness = Some(freshness);
    }

    /// `None` clears the flag after a complete restore
    pub async fn set_restore_incomplete(&self, reason: Option<String>) {
        self.flags.write().await.restore_incomplete = reason;
    }

    pub async fn set_no_providers(&self, none_available: bool) {
        self.flags.write().await.no_providers = none_available;
    }

    pub async fn record_aggregation(&self, result: Result<DateTime<Utc>, String>) {
        let mut flags = self.flags.write().await;
        match result {
            Ok(at) => {
                flags.last_aggregation_at = Some(at);
                flags.last_aggregation_error = None;
            }
            Err(e) => flags.last_aggregation_error = Some(e),
        }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let flags = self.flags.read().await;
        let mut reasons = Vec::new();

        if let Some(freshness) = &flags.freshness {
            if freshness.status != LocalDataStatus::Healthy {
                reasons.push(format!("local data is {:?}", freshness.status).to_lowercase());
            }
        }
        if let Some(reason) = &flags.restore_incomplete {
            reasons.push(format!("restore incomplete: {}", reason));
        }
        if flags.no_providers {
            reasons.push("no backup providers available".to_string());
        }
        if let Some(error) = &flags.last_aggregation_error {
            reasons.push(format!("aggregation failing: {}", error));
        }

        HealthSnapshot {
            degraded: !reasons.is_empty(),
            reasons,
            freshness: flags.freshness.clone(),
            restore_incomplete: flags.restore_incomplete.clone(),
            no_providers: flags.no_providers,
            last_aggregation_at: flags.last_aggregation_at,
            last_aggregation_error: flags.last_aggregation_error.clone(),
        }
    }
}
