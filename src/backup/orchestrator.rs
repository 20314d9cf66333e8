//! Backup orchestrator
//!
//! One run: enumerate files, push them through every available provider,
//! write the manifest (local providers first), prune old local snapshots.
//! Runs never overlap; a trigger that arrives during a run is coalesced.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::manifest::{BackupManifest, FileKind, FileRecord, FileStatus, KeyLayout, ProviderOutcome, RunId};
use super::provider::{BackupProvider, ProviderKind};
use super::registry::ProviderRegistry;
use super::sync_db::{sha256_hex, Fingerprint, SyncDatabase};
use crate::aggregate::artifacts;
use crate::config::BackupConfig;
use crate::error::{BackupError, ProviderError};
use crate::shard::ShardStore;
use crate::RunOutcome;

/// Upper bound for the in-run retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTrigger {
    Scheduled,
    Manual,
    Critical,
    Rotation,
}

impl BackupTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupTrigger::Scheduled => "scheduled",
            BackupTrigger::Manual => "manual",
            BackupTrigger::Critical => "critical",
            BackupTrigger::Rotation => "rotation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Idle,
    Enumerating,
    Uploading,
    Summarizing,
}

/// Counters exposed through the status endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStats {
    pub phase: RunPhase,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub coalesced_triggers: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_trigger: Option<BackupTrigger>,
    pub last_run_files: usize,
    pub last_run_bytes: u64,
    pub last_manifest_key: Option<String>,
    pub last_error: Option<String>,
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct BackupRunReport {
    pub manifest: BackupManifest,
    pub manifest_key: Option<String>,
    /// Providers that accepted the manifest, local first
    pub manifest_stored_on: Vec<String>,
    pub bytes_uploaded: u64,
    pub pruned_objects: usize,
    /// Every attempted file reached at least one provider and the manifest was stored
    pub success: bool,
}

/// A file read into memory for one run
struct PendingFile {
    name: String,
    kind: FileKind,
    key: String,
    data: Bytes,
    sha256: String,
    /// Indices into the run's provider list
    targets: Vec<usize>,
}

struct ProviderRun {
    outcomes: Vec<(usize, ProviderOutcome)>,
    bytes: u64,
    interrupted: bool,
}

/// Retry and retention knobs
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub enabled: bool,
    pub store_retries: u32,
    pub retry_backoff: Duration,
    pub max_local_backups: usize,
}

impl From<&BackupConfig> for BackupSettings {
    fn from(config: &BackupConfig) -> Self {
        Self {
            enabled: config.enabled,
            store_retries: config.store_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_local_backups: config.max_local_backups,
        }
    }
}

#[derive(Clone)]
pub struct BackupOrchestrator {
    settings: BackupSettings,
    layout: KeyLayout,
    store: ShardStore,
    artifact_dir: PathBuf,
    registry: Arc<ProviderRegistry>,
    sync_db: Arc<SyncDatabase>,
    /// Held for the length of a run; remembers the previous run id
    run_lock: Arc<Mutex<Option<RunId>>>,
    stats: Arc<RwLock<BackupStats>>,
    shutdown: CancellationToken,
}

impl BackupOrchestrator {
    pub fn new(
        settings: BackupSettings,
        layout: KeyLayout,
        store: ShardStore,
        artifact_dir: PathBuf,
        registry: Arc<ProviderRegistry>,
        sync_db: Arc<SyncDatabase>,
    ) -> Self {
        Self {
            settings,
            layout,
            store,
            artifact_dir,
            registry,
            sync_db,
            run_lock: Arc::new(Mutex::new(None)),
            stats: Arc::new(RwLock::new(BackupStats::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop uploading after the current file once `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub async fn stats(&self) -> BackupStats {
        self.stats.read().await.clone()
    }

    async fn set_phase(&self, phase: RunPhase) {
        self.stats.write().await.phase = phase;
    }

    /// Run one backup, or coalesce into the run already in flight
    pub async fn run(&self, trigger: BackupTrigger) -> Result<RunOutcome<BackupRunReport>, BackupError> {
        if !self.settings.enabled {
            return Err(BackupError::Disabled);
        }
        let mut guard = match self.run_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Backup already running, coalescing {} trigger", trigger.as_str());
                self.stats.write().await.coalesced_triggers += 1;
                return Ok(RunOutcome::Coalesced);
            }
        };

        let run = RunId::next_after(Utc::now(), *guard);
        *guard = Some(run);
        let run_timestamp = run.timestamp();
        info!("Starting backup run ({})", trigger.as_str());

        let result = self.run_locked(trigger, run).await;
        let mut stats = self.stats.write().await;
        stats.phase = RunPhase::Idle;
        stats.total_runs += 1;
        stats.last_run_at = Some(run_timestamp);
        stats.last_trigger = Some(trigger);
        match &result {
            Ok(report) => {
                stats.last_run_files = report.manifest.files_attempted;
                stats.last_run_bytes = report.bytes_uploaded;
                if report.manifest_key.is_some() {
                    stats.last_manifest_key = report.manifest_key.clone();
                }
                if report.success {
                    stats.successful_runs += 1;
                    stats.last_success_at = Some(run_timestamp);
                    stats.last_error = None;
                } else {
                    stats.failed_runs += 1;
                    stats.last_error = Some(if report.manifest.interrupted {
                        "run interrupted by shutdown".to_string()
                    } else if report.manifest_stored_on.is_empty() {
                        "manifest not stored on any provider".to_string()
                    } else {
                        format!(
                            "{} of {} files reached no provider",
                            report.manifest.files_failed, report.manifest.files_attempted
                        )
                    });
                }
            }
            Err(e) => {
                stats.failed_runs += 1;
                stats.last_error = Some(e.to_string());
            }
        }
        drop(stats);

        result.map(RunOutcome::Completed)
    }

    async fn run_locked(&self, trigger: BackupTrigger, run: RunId) -> Result<BackupRunReport, BackupError> {
        let run_timestamp = run.timestamp();
        let providers = self.registry.available();
        if providers.is_empty() {
            warn!("Backup skipped: no providers available");
            return Err(BackupError::NoProvidersAvailable);
        }
        let names: Vec<String> = providers.iter().map(|p| p.name().to_string()).collect();

        self.set_phase(RunPhase::Enumerating).await;
        let files = {
            let store = self.store.clone();
            let artifact_dir = self.artifact_dir.clone();
            let layout = self.layout.clone();
            let sync_db = self.sync_db.clone();
            let names = names.clone();
            tokio::task::spawn_blocking(move || {
                enumerate(&store, &artifact_dir, &layout, run, &names, &sync_db)
            })
            .await
            .map_err(|e| BackupError::Enumerate(e.to_string()))??
        };
        info!("Enumerated {} files for backup", files.len());

        if files.is_empty() {
            info!("Nothing changed since the last backup");
            return Ok(BackupRunReport {
                manifest: BackupManifest::new(run_timestamp, trigger.as_str(), names, Vec::new()),
                manifest_key: None,
                manifest_stored_on: Vec::new(),
                bytes_uploaded: 0,
                pruned_objects: 0,
                success: true,
            });
        }

        self.set_phase(RunPhase::Uploading).await;
        let runs = join_all(
            providers
                .iter()
                .enumerate()
                .map(|(idx, provider)| self.upload_to(idx, provider.as_ref(), &files, run_timestamp)),
        )
        .await;

        self.set_phase(RunPhase::Summarizing).await;
        let mut per_file: Vec<Vec<ProviderOutcome>> = vec![Vec::new(); files.len()];
        let mut interrupted = false;
        let mut bytes_uploaded = 0;
        for run in runs {
            interrupted |= run.interrupted;
            bytes_uploaded += run.bytes;
            for (file_idx, outcome) in run.outcomes {
                per_file[file_idx].push(outcome);
            }
        }

        let records: Vec<FileRecord> = files
            .iter()
            .zip(per_file)
            .filter(|(_, outcomes)| !outcomes.is_empty())
            .map(|(file, outcomes)| {
                let status = if outcomes.iter().any(|o| o.status == FileStatus::Succeeded) {
                    FileStatus::Succeeded
                } else {
                    FileStatus::Failed
                };
                FileRecord {
                    path: file.name.clone(),
                    kind: file.kind,
                    size: file.data.len() as u64,
                    sha256: file.sha256.clone(),
                    status,
                    outcomes,
                }
            })
            .collect();

        for record in records.iter().filter(|r| r.status == FileStatus::Failed) {
            error!("File {} was rejected by every provider", record.path);
        }

        let mut manifest = BackupManifest::new(run_timestamp, trigger.as_str(), names, records);
        manifest.interrupted = interrupted;

        let (manifest_key, stored_on) = self.store_manifest(run, &manifest).await?;
        let pruned_objects = self.prune_local().await;

        if let Err(e) = self.sync_db.flush() {
            warn!("Failed to flush sync database: {}", e);
        }

        let success = manifest.is_success() && !stored_on.is_empty() && !interrupted;
        info!(
            "Backup run ({}) finished: {}/{} files stored, {} bytes, manifest on {:?}",
            trigger.as_str(),
            manifest.files_succeeded,
            manifest.files_attempted,
            bytes_uploaded,
            stored_on
        );

        Ok(BackupRunReport {
            manifest,
            manifest_key: Some(manifest_key),
            manifest_stored_on: stored_on,
            bytes_uploaded,
            pruned_objects,
            success,
        })
    }

    /// Serialized upload loop for one provider
    async fn upload_to(
        &self,
        idx: usize,
        provider: &dyn BackupProvider,
        files: &[PendingFile],
        run_timestamp: DateTime<Utc>,
    ) -> ProviderRun {
        let mut run = ProviderRun {
            outcomes: Vec::new(),
            bytes: 0,
            interrupted: false,
        };
        let mut disabled: Option<String> = None;

        for (file_idx, file) in files.iter().enumerate() {
            if !file.targets.contains(&idx) {
                continue;
            }
            if self.shutdown.is_cancelled() {
                info!("Shutdown requested, stopping uploads to {}", provider.name());
                run.interrupted = true;
                break;
            }

            if let Some(reason) = &disabled {
                run.outcomes.push((file_idx, failed_outcome(provider, &file.key, reason.clone(), 0)));
                continue;
            }

            let (result, attempts) = self.store_with_retry(provider, &file.key, file.data.clone()).await;
            match result {
                Ok(()) => {
                    run.bytes += file.data.len() as u64;
                    if file.kind == FileKind::Csv {
                        let fingerprint = Fingerprint {
                            path: file.name.clone(),
                            key: file.key.clone(),
                            size: file.data.len() as u64,
                            sha256: file.sha256.clone(),
                            last_sync: run_timestamp.timestamp(),
                        };
                        if let Err(e) = self.sync_db.set(provider.name(), &fingerprint) {
                            warn!("Failed to record fingerprint for {}: {}", file.name, e);
                        }
                    }
                    run.outcomes.push((
                        file_idx,
                        ProviderOutcome {
                            provider: provider.name().to_string(),
                            status: FileStatus::Succeeded,
                            key: file.key.clone(),
                            error: None,
                            attempts,
                        },
                    ));
                }
                Err(e) => {
                    warn!("Failed to back up {} to {}: {}", file.name, provider.name(), e);
                    if e.is_permanent() {
                        self.registry.mark_unavailable(provider.name(), &e.to_string());
                        disabled = Some(format!("provider unavailable: {}", e));
                    }
                    run.outcomes.push((file_idx, failed_outcome(provider, &file.key, e.to_string(), attempts)));
                }
            }
        }
        run
    }

    /// Store with bounded exponential backoff on transient failures
    async fn store_with_retry(
        &self,
        provider: &dyn BackupProvider,
        key: &str,
        data: Bytes,
    ) -> (Result<(), ProviderError>, u32) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match provider.store(key, data.clone()).await {
                Ok(()) => return (Ok(()), attempt),
                Err(ProviderError::Transient(msg)) if attempt <= self.settings.store_retries => {
                    let delay = retry_delay(self.settings.retry_backoff, attempt);
                    debug!(
                        "Transient failure storing {} on {} (attempt {}), retrying in {:?}: {}",
                        key,
                        provider.name(),
                        attempt,
                        delay,
                        msg
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            return (Err(ProviderError::Transient(msg)), attempt);
                        }
                    }
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    /// Store the manifest on local providers, then remote ones
    async fn store_manifest(&self, run: RunId, manifest: &BackupManifest) -> Result<(String, Vec<String>), BackupError> {
        let key = self.layout.manifest_key(run);
        let data = Bytes::from(serde_json::to_vec_pretty(manifest)?);

        let mut providers = self.registry.available();
        providers.sort_by_key(|p| match p.kind() {
            ProviderKind::Local => 0,
            ProviderKind::Remote => 1,
        });

        let mut stored_on = Vec::new();
        for provider in providers {
            let (result, _) = self.store_with_retry(provider.as_ref(), &key, data.clone()).await;
            match result {
                Ok(()) => stored_on.push(provider.name().to_string()),
                Err(e) => {
                    warn!("Failed to store manifest on {}: {}", provider.name(), e);
                    if e.is_permanent() {
                        self.registry.mark_unavailable(provider.name(), &e.to_string());
                    }
                }
            }
        }
        if stored_on.is_empty() {
            error!("Manifest {} could not be stored on any provider", key);
        }
        Ok((key, stored_on))
    }

    /// Keep the newest runs' snapshots on local providers; shard objects are never pruned
    async fn prune_local(&self) -> usize {
        let keep = self.settings.max_local_backups;
        if keep == 0 {
            return 0;
        }

        let mut pruned = 0;
        for provider in self.registry.available() {
            if provider.kind() != ProviderKind::Local {
                continue;
            }
            let objects = match provider.list(&self.layout.root()).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!("Retention listing failed on {}: {}", provider.name(), e);
                    continue;
                }
            };

            let mut runs: BTreeMap<RunId, Vec<String>> = BTreeMap::new();
            for object in objects {
                if let Some(run) = self.layout.snapshot_run(&object.key) {
                    runs.entry(run).or_default().push(object.key);
                }
            }

            let excess = runs.len().saturating_sub(keep);
            for (run, keys) in runs.into_iter().take(excess) {
                debug!("Pruning run {:?} from {}", run, provider.name());
                for key in keys {
                    match provider.delete(&key).await {
                        Ok(()) => pruned += 1,
                        Err(e) => warn!("Failed to prune {} from {}: {}", key, provider.name(), e),
                    }
                }
            }
        }
        if pruned > 0 {
            info!("Retention removed {} old backup objects", pruned);
        }
        pruned
    }
}

fn failed_outcome(provider: &dyn BackupProvider, key: &str, error: String, attempts: u32) -> ProviderOutcome {
    ProviderOutcome {
        provider: provider.name().to_string(),
        status: FileStatus::Failed,
        key: key.to_string(),
        error: Some(error),
        attempts,
    }
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        .min(MAX_RETRY_DELAY)
}

/// Read every file this run should send. Shards go only to providers whose
/// fingerprint differs; artifacts go to every provider.
fn enumerate(
    store: &ShardStore,
    artifact_dir: &Path,
    layout: &KeyLayout,
    run: RunId,
    providers: &[String],
    sync_db: &SyncDatabase,
) -> Result<Vec<PendingFile>, BackupError> {
    let mut files = Vec::new();

    let shards = store
        .list_shards()
        .map_err(|e| BackupError::Enumerate(e.to_string()))?;
    for shard in shards {
        let data = match fs::read(&shard.path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot read shard {} for backup: {}", shard.id.file_name, e);
                continue;
            }
        };
        let sha256 = sha256_hex(&data);
        let mut targets = Vec::new();
        for (idx, provider) in providers.iter().enumerate() {
            if sync_db.has_changed(provider, &shard.id.file_name, &sha256)? {
                targets.push(idx);
            }
        }
        if targets.is_empty() {
            continue;
        }
        files.push(PendingFile {
            key: layout.shard_key(run, &shard.id.file_name),
            name: shard.id.file_name,
            kind: FileKind::Csv,
            data: Bytes::from(data),
            sha256,
            targets,
        });
    }

    for path in artifacts::list_artifacts(artifact_dir) {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot read artifact {} for backup: {}", name, e);
                continue;
            }
        };
        files.push(PendingFile {
            key: layout.artifact_key(run, &name),
            sha256: sha256_hex(&data),
            name,
            kind: FileKind::Json,
            data: Bytes::from(data),
            targets: (0..providers.len()).collect(),
        });
    }

    Ok(files)
}
