//! Startup and on-demand recovery
//!
//! Decides whether local data needs restoring, then pulls the newest usable
//! manifest from the first provider that has one (remote before local) and
//! fetches what it records. Restored files keep the timestamp they were backed
//! up with, so the freshness re-check reflects the age of the backup rather
//! than the time of the restore. Nothing here returns an error: an incomplete
//! restore becomes a health flag.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::aggregate::artifacts::{self, HISTORICAL_FILE, INDEX_FILE, METADATA_FILE};
use crate::backup::manifest::{BackupManifest, FileKind, KeyLayout, RunId};
use crate::backup::provider::BackupProvider;
use crate::backup::registry::ProviderRegistry;
use crate::backup::sync_db::sha256_hex;
use crate::config::{RecoveryConfig, MAX_STALENESS_MINUTES};
use crate::error::ProviderError;
use crate::health::{Freshness, HealthState, LocalDataStatus};
use crate::shard::ShardStore;
use crate::RunOutcome;

/// historical.json smaller than this holds no usable series
pub const MIN_HISTORICAL_BYTES: u64 = 100;

/// Classify the local data directory. Summary artifacts (metadata, index) do
/// not count towards freshness since they are rewritten on every pass.
pub fn assess_local_data(
    store: &ShardStore,
    artifact_dir: &Path,
    staleness: Duration,
    now: DateTime<Utc>,
) -> Freshness {
    let mut freshness = Freshness {
        status: LocalDataStatus::Missing,
        newest_modified: None,
        shard_count: 0,
        artifact_count: 0,
        checked_at: now,
    };
    if !store.dir().exists() && !artifact_dir.exists() {
        return freshness;
    }

    let shards = store.list_shards().unwrap_or_default();
    let artifact_files = artifacts::list_artifacts(artifact_dir);
    freshness.shard_count = shards.len();
    freshness.artifact_count = artifact_files.len();

    if shards.is_empty() && artifact_files.is_empty() {
        freshness.status = LocalDataStatus::Empty;
        return freshness;
    }

    let data_artifact_times = artifact_files.iter().filter_map(|path| {
        let name = path.file_name()?.to_str()?;
        if name == METADATA_FILE || name == INDEX_FILE {
            return None;
        }
        fs::metadata(path).ok()?.modified().ok().map(DateTime::<Utc>::from)
    });
    freshness.newest_modified = shards
        .iter()
        .map(|s| s.modified)
        .chain(data_artifact_times)
        .max();

    let historical = artifact_dir.join(HISTORICAL_FILE);
    if let Ok(meta) = fs::metadata(&historical) {
        if meta.len() < MIN_HISTORICAL_BYTES {
            freshness.status = LocalDataStatus::Incomplete;
            return freshness;
        }
    }

    freshness.status = match freshness.newest_modified {
        Some(newest) if now - newest <= staleness => LocalDataStatus::Healthy,
        _ => LocalDataStatus::Stale,
    };
    freshness
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub staleness: Duration,
    pub include_all_shards: bool,
}

impl From<&RecoveryConfig> for RecoverySettings {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            staleness: Duration::minutes(config.staleness_threshold_minutes.clamp(1, MAX_STALENESS_MINUTES)),
            include_all_shards: config.include_all_shards,
        }
    }
}

/// What a recovery pass did
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub started_at: DateTime<Utc>,
    pub before: Freshness,
    pub after: Freshness,
    pub restore_attempted: bool,
    pub provider: Option<String>,
    pub manifest_key: Option<String>,
    pub files_restored: usize,
    pub files_skipped_newer: usize,
    pub files_failed: usize,
    pub shards_restored: usize,
    /// Set when the system still lacks fresh data afterwards
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Default)]
struct RestoreCounts {
    restored: usize,
    skipped_newer: usize,
    failed: usize,
}

#[derive(Clone)]
pub struct RecoveryCoordinator {
    settings: RecoverySettings,
    store: ShardStore,
    artifact_dir: PathBuf,
    layout: KeyLayout,
    registry: Arc<ProviderRegistry>,
    health: HealthState,
    run_lock: Arc<Mutex<()>>,
    /// Shared with the aggregation engine, which otherwise writes the artifacts alone
    artifact_lock: Arc<Mutex<()>>,
}

impl RecoveryCoordinator {
    pub fn new(
        settings: RecoverySettings,
        store: ShardStore,
        artifact_dir: PathBuf,
        layout: KeyLayout,
        registry: Arc<ProviderRegistry>,
        health: HealthState,
    ) -> Self {
        Self {
            settings,
            store,
            artifact_dir,
            layout,
            registry,
            health,
            run_lock: Arc::new(Mutex::new(())),
            artifact_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Write restored artifacts only while holding `lock`
    pub fn with_artifact_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.artifact_lock = lock;
        self
    }

    /// Check freshness and publish it to the health state
    pub async fn check_freshness(&self) -> Freshness {
        let store = self.store.clone();
        let dir = self.artifact_dir.clone();
        let staleness = self.settings.staleness;
        let freshness = tokio::task::spawn_blocking(move || {
            assess_local_data(&store, &dir, staleness, Utc::now())
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Freshness check task failed: {}", e);
            Freshness {
                status: LocalDataStatus::Missing,
                newest_modified: None,
                shard_count: 0,
                artifact_count: 0,
                checked_at: Utc::now(),
            }
        });
        self.health.set_freshness(freshness.clone()).await;
        self.health.set_no_providers(!self.registry.any_available()).await;
        freshness
    }

    /// Restore if local data is stale or absent. `force` restores regardless.
    pub async fn run(&self, force: bool) -> RunOutcome<RecoveryReport> {
        let _guard = match self.run_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Recovery already running, coalescing request");
                return RunOutcome::Coalesced;
            }
        };

        let started_at = Utc::now();
        let before = self.check_freshness().await;
        info!("Local data status: {:?}", before.status);

        let mut report = RecoveryReport {
            started_at,
            before: before.clone(),
            after: before.clone(),
            restore_attempted: false,
            provider: None,
            manifest_key: None,
            files_restored: 0,
            files_skipped_newer: 0,
            files_failed: 0,
            shards_restored: 0,
            degraded_reason: None,
        };

        if !force && !before.status.needs_restore() {
            info!("Local data is fresh, no restore needed");
            self.health.set_restore_incomplete(None).await;
            return RunOutcome::Completed(report);
        }

        let providers = self.registry.restore_order();
        if providers.is_empty() {
            warn!("Restore not possible: no backup providers available");
        } else {
            report.restore_attempted = true;
            self.restore_newest_manifest(&providers, &mut report).await;
            if self.settings.include_all_shards {
                report.shards_restored = self.restore_missing_shards(&providers).await;
            }
        }

        let after = self.check_freshness().await;
        report.degraded_reason = match after.status {
            LocalDataStatus::Healthy if report.files_failed == 0 => None,
            LocalDataStatus::Healthy => Some(format!("{} files failed to restore", report.files_failed)),
            status if providers.is_empty() => {
                Some(format!("local data is {:?} and no providers are available", status).to_lowercase())
            }
            status => Some(format!("local data is still {:?} after restore", status).to_lowercase()),
        };
        report.after = after;

        match &report.degraded_reason {
            Some(reason) => warn!("Recovery finished degraded: {}", reason),
            None => info!(
                "Recovery complete: {} files, {} extra shards restored",
                report.files_restored, report.shards_restored
            ),
        }
        self.health.set_restore_incomplete(report.degraded_reason.clone()).await;
        RunOutcome::Completed(report)
    }

    async fn restore_newest_manifest(&self, providers: &[Arc<dyn BackupProvider>], report: &mut RecoveryReport) {
        for provider in providers {
            match self.restore_from(provider.as_ref()).await {
                Ok(Some((key, counts))) => {
                    report.provider = Some(provider.name().to_string());
                    report.manifest_key = Some(key);
                    report.files_restored = counts.restored;
                    report.files_skipped_newer = counts.skipped_newer;
                    report.files_failed = counts.failed;
                    return;
                }
                Ok(None) => debug!("No usable manifest on {}", provider.name()),
                Err(e) => {
                    warn!("Restore from {} failed: {}", provider.name(), e);
                    if e.is_permanent() {
                        self.registry.mark_unavailable(provider.name(), &e.to_string());
                    }
                }
            }
        }
        warn!("No provider had a usable manifest");
    }

    /// Restore from the newest complete manifest on `provider` that lists files
    /// it stored. An interrupted run is used only when no complete one exists.
    async fn restore_from(
        &self,
        provider: &dyn BackupProvider,
    ) -> Result<Option<(String, RestoreCounts)>, ProviderError> {
        let objects = provider.list(&self.layout.root()).await?;
        let mut manifests: Vec<_> = objects
            .into_iter()
            .filter_map(|o| self.layout.manifest_run(&o.key).map(|run| (run, o.key)))
            .collect();
        manifests.sort_by(|a, b| b.0.cmp(&a.0));
        debug!("Found {} manifests on {}", manifests.len(), provider.name());

        let mut interrupted: Option<(String, BackupManifest)> = None;
        for (_, key) in manifests {
            let manifest: BackupManifest = match provider.fetch(&key).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        warn!("Manifest {} is corrupt: {}", key, e);
                        continue;
                    }
                },
                Err(ProviderError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if manifest.succeeded_for(provider.name()).next().is_none() {
                continue;
            }
            if manifest.interrupted {
                debug!("Manifest {} is from an interrupted run, looking further back", key);
                interrupted.get_or_insert((key, manifest));
                continue;
            }

            info!("Restoring from manifest {} on {}", key, provider.name());
            let counts = self.restore_manifest(provider, &manifest).await;
            return Ok(Some((key, counts)));
        }

        match interrupted {
            Some((key, manifest)) => {
                warn!("Only interrupted runs on {}, restoring from {}", provider.name(), key);
                let counts = self.restore_manifest(provider, &manifest).await;
                Ok(Some((key, counts)))
            }
            None => Ok(None),
        }
    }

    async fn restore_manifest(&self, provider: &dyn BackupProvider, manifest: &BackupManifest) -> RestoreCounts {
        let mut counts = RestoreCounts::default();
        let backed_up_at: SystemTime = manifest.run_timestamp.into();
        let _writer = self.artifact_lock.lock().await;

        for (record, outcome) in manifest.succeeded_for(provider.name()) {
            let local = match self.local_path(record.kind, &record.path) {
                Some(path) => path,
                None => {
                    warn!("Manifest entry {:?} is not a plain file name, skipping", record.path);
                    counts.failed += 1;
                    continue;
                }
            };

            if let Some(modified) = fs::metadata(&local).and_then(|m| m.modified()).ok() {
                if modified > backed_up_at {
                    debug!("Keeping local {} which is newer than the backup", record.path);
                    counts.skipped_newer += 1;
                    continue;
                }
            }

            let data = match provider.fetch(&outcome.key).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("Failed to fetch {}: {}", outcome.key, e);
                    counts.failed += 1;
                    continue;
                }
            };
            if sha256_hex(&data) != record.sha256 {
                warn!("Checksum mismatch for {}, not restoring", outcome.key);
                counts.failed += 1;
                continue;
            }

            match write_restored(local, data, backed_up_at).await {
                Ok(()) => counts.restored += 1,
                Err(e) => {
                    warn!("Failed to write restored {}: {}", record.path, e);
                    counts.failed += 1;
                }
            }
        }
        counts
    }

    /// Fetch backed-up shards that are absent locally, taking the newest run's
    /// copy of each
    async fn restore_missing_shards(&self, providers: &[Arc<dyn BackupProvider>]) -> usize {
        let mut present: HashSet<String> = self
            .store
            .list_shards()
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.id.file_name)
            .collect();
        let mut restored = 0;

        for provider in providers {
            let objects = match provider.list(&self.layout.csv_prefix()).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!("Cannot list shards on {}: {}", provider.name(), e);
                    continue;
                }
            };
            let mut newest: BTreeMap<String, (RunId, String)> = BTreeMap::new();
            for object in objects {
                let Some((run, name)) = self.layout.shard_object(&object.key) else {
                    continue;
                };
                if present.contains(name) {
                    continue;
                }
                let is_newer = newest.get(name).map(|(seen, _)| run > *seen).unwrap_or(true);
                if is_newer {
                    newest.insert(name.to_string(), (run, object.key.clone()));
                }
            }

            for (name, (run, key)) in newest {
                let data = match provider.fetch(&key).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Failed to fetch shard {}: {}", key, e);
                        continue;
                    }
                };
                match write_restored(self.store.dir().join(&name), data, run.timestamp().into()).await {
                    Ok(()) => {
                        present.insert(name);
                        restored += 1;
                    }
                    Err(e) => warn!("Failed to write shard {}: {}", name, e),
                }
            }
        }
        if restored > 0 {
            info!("Restored {} shards missing locally", restored);
        }
        restored
    }

    fn local_path(&self, kind: FileKind, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != "..";
        if !plain {
            return None;
        }
        Some(match kind {
            FileKind::Csv => self.store.dir().join(name),
            FileKind::Json => self.artifact_dir.join(name),
        })
    }
}

/// Atomically write restored bytes and stamp them with their backup time
async fn write_restored(path: PathBuf, data: Bytes, modified: SystemTime) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        artifacts::write_atomic(&path, &data)?;
        fs::File::options().write(true).open(&path)?.set_modified(modified)?;
        Ok(())
    })
    .await?
}
