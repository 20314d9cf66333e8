//! Service wiring and periodic tasks
//!
//! Builds the engine, orchestrator and recovery coordinator from one config,
//! runs startup recovery, then drives everything from a handful of interval
//! loops plus a trigger channel. All loops stop when the shutdown token is
//! cancelled.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregationEngine, AggregationReport, AggregationSettings};
use crate::backup::{
    BackupOrchestrator, BackupRunReport, BackupSettings, BackupTrigger, KeyLayout, ProviderRegistry, SyncDatabase,
};
use crate::config::{Config, MAX_INTERVAL_SECONDS};
use crate::error::{AggregateError, BackupError};
use crate::health::HealthState;
use crate::recovery::{RecoveryCoordinator, RecoverySettings};
use crate::shard::ShardStore;
use crate::RunOutcome;

/// Work requests funnelled into the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Aggregate,
    Backup(BackupTrigger),
}

/// Counts consecutive ingestion errors and fires once per threshold crossing
#[derive(Debug)]
pub struct CriticalEventMonitor {
    threshold: u32,
    consecutive: AtomicU32,
}

impl CriticalEventMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicU32::new(0),
        }
    }

    /// Returns true when this error reaches the threshold; the count then resets
    pub fn record_error(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold {
            self.consecutive.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

/// Cloneable sender for triggers; never blocks the caller. Ingestion events
/// are counted before anything is queued, so a full queue never loses one.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<Trigger>,
    monitor: Arc<CriticalEventMonitor>,
}

impl TriggerHandle {
    pub fn send(&self, trigger: Trigger) {
        if let Err(e) = self.tx.try_send(trigger) {
            // A full queue already holds work that will cover this trigger
            debug!("Dropping trigger {:?}: {}", trigger, e);
        }
    }

    pub fn aggregate(&self) {
        self.send(Trigger::Aggregate);
    }

    pub fn backup(&self, trigger: BackupTrigger) {
        self.send(Trigger::Backup(trigger));
    }

    pub fn ingestion_error(&self) {
        if self.monitor.record_error() {
            warn!("Critical event: consecutive ingestion errors reached threshold");
            self.backup(BackupTrigger::Critical);
        }
    }

    pub fn ingestion_ok(&self) {
        self.monitor.record_success();
    }
}

pub struct Service {
    pub config: Config,
    pub engine: AggregationEngine,
    pub orchestrator: BackupOrchestrator,
    pub recovery: RecoveryCoordinator,
    pub registry: Arc<ProviderRegistry>,
    pub health: HealthState,
    pub monitor: Arc<CriticalEventMonitor>,
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
    triggers: TriggerHandle,
    trigger_rx: Mutex<Option<mpsc::Receiver<Trigger>>>,
    /// Runs started from triggers, awaited on shutdown
    tasks: TaskTracker,
}

/// The sync database is a cache; an unusable path falls back to memory
fn open_sync_db(path: &Path) -> Result<Arc<SyncDatabase>> {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Cannot create sync database directory {:?}: {}", parent, e);
        }
    }
    match SyncDatabase::open(path) {
        Ok(db) => Ok(Arc::new(db)),
        Err(e) => {
            warn!("{}; falling back to an in-memory sync database", e);
            Ok(Arc::new(SyncDatabase::temporary()?))
        }
    }
}

impl Service {
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let store = ShardStore::new(&config.storage.data_dir);
        let artifact_dir = config.storage.artifact_dir().to_path_buf();
        std::fs::create_dir_all(&config.storage.data_dir)
            .context(format!("Failed to create data directory {:?}", config.storage.data_dir))?;
        std::fs::create_dir_all(&artifact_dir)
            .context(format!("Failed to create artifact directory {:?}", artifact_dir))?;

        let shutdown = CancellationToken::new();
        let health = HealthState::new();
        let layout = KeyLayout::new(&config.backup.prefix);

        let registry = Arc::new(if config.backup.enabled {
            ProviderRegistry::initialize(&config.backup).await
        } else {
            info!("Backups disabled by configuration");
            ProviderRegistry::default()
        });
        let sync_db = open_sync_db(&config.backup.sync_db_path)?;

        let engine = AggregationEngine::new(
            store.clone(),
            artifact_dir.clone(),
            AggregationSettings::from(&config.aggregation),
        );
        let orchestrator = BackupOrchestrator::new(
            BackupSettings::from(&config.backup),
            layout.clone(),
            store.clone(),
            artifact_dir.clone(),
            registry.clone(),
            sync_db,
        )
        .with_shutdown(shutdown.clone());
        let recovery = RecoveryCoordinator::new(
            RecoverySettings::from(&config.recovery),
            store,
            artifact_dir,
            layout,
            registry.clone(),
            health.clone(),
        )
        .with_artifact_lock(engine.writer_lock());

        let (tx, rx) = mpsc::channel(32);
        let monitor = Arc::new(CriticalEventMonitor::new(config.backup.critical_error_threshold));
        Ok(Arc::new(Self {
            triggers: TriggerHandle {
                tx,
                monitor: monitor.clone(),
            },
            monitor,
            config,
            engine,
            orchestrator,
            recovery,
            registry,
            health,
            shutdown,
            started_at: Utc::now(),
            trigger_rx: Mutex::new(Some(rx)),
            tasks: TaskTracker::new(),
        }))
    }

    pub fn triggers(&self) -> TriggerHandle {
        self.triggers.clone()
    }

    /// Recovery (or a plain freshness check) followed by one regeneration
    pub async fn startup(&self) {
        if self.config.recovery.auto_restore_on_startup {
            if let RunOutcome::Completed(report) = self.recovery.run(false).await {
                if report.restore_attempted {
                    info!(
                        "Startup restore: {} files from {:?}, {} extra shards",
                        report.files_restored, report.provider, report.shards_restored
                    );
                }
            }
        } else {
            let freshness = self.recovery.check_freshness().await;
            info!("Startup restore disabled; local data is {:?}", freshness.status);
        }

        if let Err(e) = self.aggregate().await {
            warn!("Initial aggregation failed: {}", e);
        }
    }

    /// One aggregation pass with health bookkeeping
    pub async fn aggregate(&self) -> Result<RunOutcome<AggregationReport>, AggregateError> {
        let result = self.engine.regenerate().await;
        match &result {
            Ok(RunOutcome::Completed(report)) => {
                self.health.record_aggregation(Ok(report.finished_at)).await;
            }
            Ok(RunOutcome::Coalesced) => {}
            Err(e) => {
                warn!("Aggregation failed: {}", e);
                self.health.record_aggregation(Err(e.to_string())).await;
            }
        }
        result
    }

    /// One backup run with logging; errors are reported, not propagated further
    pub async fn backup(&self, trigger: BackupTrigger) -> Result<RunOutcome<BackupRunReport>, BackupError> {
        let result = self.orchestrator.run(trigger).await;
        match &result {
            Ok(RunOutcome::Completed(report)) if !report.success => {
                warn!("Backup run ({}) finished with failures", trigger.as_str());
            }
            Ok(_) => {}
            Err(BackupError::Disabled) => debug!("Backup trigger ignored, backups disabled"),
            Err(e) => warn!("Backup run ({}) failed: {}", trigger.as_str(), e),
        }
        self.health.set_no_providers(!self.registry.any_available()).await;
        result
    }

    fn handle_trigger(self: &Arc<Self>, trigger: Trigger) {
        let service = self.clone();
        match trigger {
            Trigger::Aggregate => {
                self.tasks.spawn(async move {
                    let _ = service.aggregate().await;
                });
            }
            Trigger::Backup(kind) => {
                self.tasks.spawn(async move {
                    let _ = service.backup(kind).await;
                });
            }
        }
    }

    /// Wait for runs started from triggers. Call after cancelling `shutdown`;
    /// a backup then stops after its current file and records the interruption.
    pub async fn drain(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!("Waiting for {} in-flight runs", self.tasks.len());
        }
        self.tasks.wait().await;
    }

    /// Spawn the periodic loops and the trigger dispatcher
    pub async fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(mut rx) = self.trigger_rx.lock().await.take() {
            let service = self.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = service.shutdown.cancelled() => break,
                        trigger = rx.recv() => match trigger {
                            Some(trigger) => service.handle_trigger(trigger),
                            None => break,
                        },
                    }
                }
                debug!("Trigger dispatcher stopped");
            }));
        }

        let service = self.clone();
        handles.push(spawn_periodic(
            "aggregation",
            loop_period(self.config.aggregation.interval_seconds),
            self.shutdown.clone(),
            move || {
                let service = service.clone();
                async move {
                    let _ = service.aggregate().await;
                }
            },
        ));

        if self.orchestrator.is_enabled() {
            let period = loop_period(self.config.backup.interval_minutes.saturating_mul(60));
            let service = self.clone();
            handles.push(spawn_periodic("backup", period, self.shutdown.clone(), move || {
                let service = service.clone();
                async move {
                    // Skip the tick when another trigger ran a backup recently
                    let cooldown = chrono::Duration::from_std(period / 2).unwrap_or_else(|_| chrono::Duration::zero());
                    if let Some(last) = service.orchestrator.stats().await.last_run_at {
                        if Utc::now() - last < cooldown {
                            debug!("Scheduled backup skipped, last run at {}", last);
                            return;
                        }
                    }
                    let _ = service.backup(BackupTrigger::Scheduled).await;
                }
            }));
        }

        let service = self.clone();
        handles.push(spawn_periodic(
            "health",
            loop_period(self.config.recovery.health_check_seconds),
            self.shutdown.clone(),
            move || {
                let service = service.clone();
                async move {
                    service.recovery.check_freshness().await;
                }
            },
        ));

        handles.push(self.spawn_rotation_watcher());
        handles
    }

    /// Emit one aggregation and one backup trigger when a new newest shard appears
    fn spawn_rotation_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        let last_seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        spawn_periodic(
            "rotation",
            loop_period(self.config.aggregation.rotation_check_seconds),
            self.shutdown.clone(),
            move || {
                let service = service.clone();
                let last_seen = last_seen.clone();
                async move {
                    let store = service.engine.store().clone();
                    let newest = tokio::task::spawn_blocking(move || store.newest())
                        .await
                        .ok()
                        .and_then(|listed| listed.ok())
                        .flatten()
                        .map(|shard| shard.id.file_name);

                    let mut last = last_seen.lock().await;
                    if let (Some(previous), Some(current)) = (last.as_ref(), newest.as_ref()) {
                        if previous != current {
                            info!("Shard rotated: {} -> {}", previous, current);
                            service.triggers.aggregate();
                            service.triggers.backup(BackupTrigger::Rotation);
                        }
                    }
                    if newest.is_some() {
                        *last = newest;
                    }
                }
            },
        )
    }
}

fn loop_period(seconds: u64) -> Duration {
    Duration::from_secs(seconds.clamp(1, MAX_INTERVAL_SECONDS))
}

/// Run `task` every `period` (first run after one period) until cancelled
fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, shutdown: CancellationToken, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Started {} loop every {:?}", name, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => task().await,
            }
        }
        debug!("{} loop stopped", name);
    })
}
