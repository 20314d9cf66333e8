//! End-to-end scenarios
//!
//! These drive the public API across module boundaries: shards on disk in,
//! artifacts and backups out, and back again through recovery.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use tower::ServiceExt;

use spread_vault::aggregate::{AggregationEngine, AggregationSettings, Metadata};
use spread_vault::backup::{
    BackupManifest, BackupOrchestrator, BackupProvider, BackupSettings, BackupTrigger, FileStatus, KeyLayout,
    LocalProvider, ObjectInfo, ProviderKind, ProviderRegistry, SyncDatabase,
};
use spread_vault::health::{HealthState, LocalDataStatus};
use spread_vault::recovery::{RecoveryCoordinator, RecoverySettings};
use spread_vault::scheduler::Service;
use spread_vault::{server, AggregateError, Config, ProviderError, ShardStore};

const HEADER: &str = "timestamp,price,bid,ask,spread,volume,spread_avg_L20_pct\n";

fn row(time: &str, price: f64, spread_pct: f64) -> String {
    format!("{},{},{},{},0.5,1.0,{}\n", time, price, price - 0.25, price + 0.25, spread_pct)
}

fn write_shard(dir: &Path, name: &str, rows: &[String]) {
    let mut content = HEADER.to_string();
    for r in rows {
        content.push_str(r);
    }
    fs::write(dir.join(name), content).unwrap();
}

/// Three overlapping 8-hour shards; 16:00 appears in both of the first two
fn write_three_shards(dir: &Path) {
    write_shard(
        dir,
        "2025-07-10_08.csv",
        &[
            row("2025-07-10T08:00:00", 100.0, 0.010),
            row("2025-07-10T08:01:00", 101.0, 0.012),
            row("2025-07-10T15:59:00", 102.0, 0.014),
            row("2025-07-10T16:00:00", 105.0, 0.016),
        ],
    );
    write_shard(
        dir,
        "2025-07-10_16.csv",
        &[
            row("2025-07-10T16:00:00", 999.0, 0.900),
            row("2025-07-10T16:01:00", 106.0, 0.018),
            row("2025-07-10T23:59:00", 107.0, 0.020),
        ],
    );
    write_shard(
        dir,
        "2025-07-11_00.csv",
        &[
            row("2025-07-11T00:00:00", 108.0, 0.022),
            row("2025-07-11T00:01:00", 109.0, 0.024),
        ],
    );
}

fn settings(windows: Vec<usize>) -> AggregationSettings {
    AggregationSettings {
        cadence_seconds: 60,
        windows,
        recent_hours: 24,
    }
}

fn engine(dir: &Path, windows: Vec<usize>) -> AggregationEngine {
    AggregationEngine::new(ShardStore::new(dir), dir.to_path_buf(), settings(windows))
}

fn read_points(dir: &Path) -> Vec<serde_json::Value> {
    let bytes = fs::read(dir.join("historical.json")).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn orchestrator(data: &Path, registry: Arc<ProviderRegistry>) -> BackupOrchestrator {
    BackupOrchestrator::new(
        BackupSettings {
            enabled: true,
            store_retries: 1,
            retry_backoff: Duration::from_millis(1),
            max_local_backups: 10,
        },
        KeyLayout::new("btc-data"),
        ShardStore::new(data),
        data.to_path_buf(),
        registry,
        Arc::new(SyncDatabase::temporary().unwrap()),
    )
}

/// Remote provider whose credentials were revoked
struct RevokedProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl BackupProvider for RevokedProvider {
    fn name(&self) -> &str {
        "s3:revoked"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    async fn store(&self, key: &str, _data: Bytes) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Permanent(format!("AccessDenied storing {}", key)))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<ObjectInfo>, ProviderError> {
        Err(ProviderError::Permanent("AccessDenied".into()))
    }

    async fn fetch(&self, key: &str) -> Result<Bytes, ProviderError> {
        Err(ProviderError::Permanent(format!("AccessDenied fetching {}", key)))
    }

    async fn delete(&self, _key: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Permanent("AccessDenied".into()))
    }
}

#[tokio::test]
async fn test_overlapping_shards_keep_first_seen_value() {
    let data = tempfile::tempdir().unwrap();
    write_three_shards(data.path());

    let report = engine(data.path(), vec![2]).regenerate().await.unwrap().completed().unwrap();
    assert_eq!(report.duplicates_dropped, 1);
    assert_eq!(report.metadata.shards_read, 3);

    let points = read_points(data.path());
    assert_eq!(points.len(), report.metadata.total_points);
    let at_rotation = points
        .iter()
        .find(|p| p["time"] == "2025-07-10T16:00:00.000Z")
        .unwrap();
    assert_eq!(at_rotation["price"], 105.0);

    let times: Vec<&str> = points.iter().map(|p| p["time"].as_str().unwrap()).collect();
    let mut sorted = times.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(times, sorted);

    assert!(data.path().join("output_2025-07-10.json").exists());
    assert!(data.path().join("output_2025-07-11.json").exists());
}

#[tokio::test]
async fn test_regeneration_is_deterministic() {
    let data = tempfile::tempdir().unwrap();
    write_three_shards(data.path());
    let engine = engine(data.path(), vec![2, 5]);

    engine.regenerate().await.unwrap();
    let first = fs::read(data.path().join("historical.json")).unwrap();

    let second_report = engine.regenerate().await.unwrap().completed().unwrap();
    let second = fs::read(data.path().join("historical.json")).unwrap();

    assert_eq!(first, second);
    assert!(!second_report.changed_files.iter().any(|f| f == "historical.json"));
}

#[tokio::test]
async fn test_validity_is_monotonic_and_coverage_grows() {
    let data = tempfile::tempdir().unwrap();
    write_three_shards(data.path());
    let engine = engine(data.path(), vec![3]);

    let first = engine.regenerate().await.unwrap().completed().unwrap().metadata;
    let points = read_points(data.path());
    let flags: Vec<bool> = points.iter().map(|p| p["ma_3_valid"].as_bool().unwrap()).collect();
    assert_eq!(&flags[..3], &[false, false, true]);
    assert!(flags[2..].iter().all(|valid| *valid));

    write_shard(
        data.path(),
        "2025-07-11_08.csv",
        &[row("2025-07-11T08:00:00", 110.0, 0.026)],
    );
    let second = engine.regenerate().await.unwrap().completed().unwrap().metadata;

    assert_eq!(first.time_range.start, second.time_range.start);
    assert!(second.time_range.end > first.time_range.end);
    assert!(second.total_points > first.total_points);
    assert!(second.valid_counts["ma_3"] > first.valid_counts["ma_3"]);
}

#[tokio::test]
async fn test_no_data_keeps_previous_artifacts() {
    let data = tempfile::tempdir().unwrap();
    write_three_shards(data.path());
    let engine = engine(data.path(), vec![2]);
    engine.regenerate().await.unwrap();
    let before = fs::read(data.path().join("historical.json")).unwrap();

    for name in ["2025-07-10_08.csv", "2025-07-10_16.csv", "2025-07-11_00.csv"] {
        fs::write(data.path().join(name), "not,a,shard\n").unwrap();
    }

    let result = engine.regenerate().await;
    assert!(matches!(result, Err(AggregateError::NoDataAvailable { shards_seen: 3 })));
    assert_eq!(fs::read(data.path().join("historical.json")).unwrap(), before);
    assert_eq!(engine.last_metadata().await.unwrap().total_points, Metadata::load(data.path()).unwrap().total_points);
}

#[tokio::test]
async fn test_backup_survives_a_revoked_remote() {
    let data = tempfile::tempdir().unwrap();
    let backups = tempfile::tempdir().unwrap();
    write_three_shards(data.path());
    engine(data.path(), vec![2]).regenerate().await.unwrap();

    let local: Arc<LocalProvider> = Arc::new(LocalProvider::new(backups.path()));
    let revoked = Arc::new(RevokedProvider { calls: AtomicUsize::new(0) });
    let registry = Arc::new(ProviderRegistry::from_providers(vec![
        local.clone() as Arc<dyn BackupProvider>,
        revoked.clone(),
    ]));
    let orchestrator = orchestrator(data.path(), registry.clone());

    let report = orchestrator.run(BackupTrigger::Manual).await.unwrap().completed().unwrap();
    assert!(report.success);
    assert_eq!(report.manifest_stored_on, vec!["local"]);
    assert_eq!(revoked.calls.load(Ordering::SeqCst), 1);

    for record in &report.manifest.files {
        assert_eq!(record.status, FileStatus::Succeeded);
        assert_eq!(record.outcomes.len(), 2);
        let remote = record.outcomes.iter().find(|o| o.provider == "s3:revoked").unwrap();
        assert_eq!(remote.status, FileStatus::Failed);
        assert!(remote.error.is_some());
    }

    let statuses = registry.statuses();
    let remote_status = statuses.iter().find(|s| s.name == "s3:revoked").unwrap();
    assert!(!remote_status.available);
    assert!(remote_status.reason.as_deref().unwrap().contains("AccessDenied"));

    // Stored bytes match the local files
    let historical = report
        .manifest
        .files
        .iter()
        .find(|r| r.path == "historical.json")
        .unwrap();
    let key = &historical.outcomes.iter().find(|o| o.provider == "local").unwrap().key;
    let fetched = local.fetch(key).await.unwrap();
    assert_eq!(fetched.as_ref(), fs::read(data.path().join("historical.json")).unwrap().as_slice());

    let manifest_bytes = local.fetch(report.manifest_key.as_deref().unwrap()).await.unwrap();
    let manifest: BackupManifest = serde_json::from_slice(&manifest_bytes).unwrap();
    assert_eq!(manifest.files_attempted, report.manifest.files_attempted);
    assert_eq!(manifest.files.len(), report.manifest.files.len());
}

#[tokio::test]
async fn test_restore_after_total_local_loss() {
    let data = tempfile::tempdir().unwrap();
    let backups = tempfile::tempdir().unwrap();
    write_three_shards(data.path());
    let original = engine(data.path(), vec![2])
        .regenerate()
        .await
        .unwrap()
        .completed()
        .unwrap()
        .metadata;

    let registry = Arc::new(ProviderRegistry::from_providers(vec![Arc::new(LocalProvider::new(backups.path()))]));
    let backup = orchestrator(data.path(), registry.clone())
        .run(BackupTrigger::Manual)
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert!(backup.success);

    // Lose everything
    fs::remove_dir_all(data.path()).unwrap();

    let health = HealthState::new();
    let recovery = RecoveryCoordinator::new(
        RecoverySettings {
            staleness: chrono::Duration::minutes(120),
            include_all_shards: true,
        },
        ShardStore::new(data.path()),
        data.path().to_path_buf(),
        KeyLayout::new("btc-data"),
        registry,
        health.clone(),
    );
    let report = recovery.run(false).await.completed().unwrap();
    assert_eq!(report.before.status, LocalDataStatus::Missing);
    assert!(report.restore_attempted);
    assert_eq!(report.provider.as_deref(), Some("local"));
    assert!(report.files_restored > 0);
    assert_eq!(report.files_failed, 0);
    assert_eq!(report.after.status, LocalDataStatus::Healthy);
    assert!(report.degraded_reason.is_none());
    assert!(!health.snapshot().await.degraded);

    let restored = ShardStore::new(data.path()).list_shards().unwrap();
    assert_eq!(restored.len(), 3);

    let regenerated = engine(data.path(), vec![2])
        .regenerate()
        .await
        .unwrap()
        .completed()
        .unwrap()
        .metadata;
    assert_eq!(regenerated.time_range, original.time_range);
    assert_eq!(regenerated.total_points, original.total_points);
}

#[tokio::test]
async fn test_stale_data_without_providers_still_serves() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    write_three_shards(&data);

    let three_hours_ago = SystemTime::now() - Duration::from_secs(3 * 3600);
    for shard in ShardStore::new(&data).list_shards().unwrap() {
        fs::File::options()
            .write(true)
            .open(&shard.path)
            .unwrap()
            .set_modified(three_hours_ago)
            .unwrap();
    }

    let mut config = Config::default();
    config.storage.data_dir = data.clone();
    config.backup.local_dir = None;
    config.backup.sync_db_path = dir.path().join("state/sync.db");
    let service = Service::build(config).await.unwrap();
    service.startup().await;

    let snapshot = service.health.snapshot().await;
    assert!(snapshot.degraded);
    assert!(snapshot.restore_incomplete.as_deref().unwrap().contains("no providers"));
    assert!(snapshot.last_aggregation_error.is_none());

    let app = server::router(service);
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/historical.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["status"], "degraded");
}

#[tokio::test]
async fn test_degraded_startup_clears_once_fresh_data_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");

    let mut config = Config::default();
    config.storage.data_dir = data.clone();
    config.backup.local_dir = None;
    config.backup.sync_db_path = dir.path().join("state/sync.db");
    let service = Service::build(config).await.unwrap();
    service.startup().await;
    assert!(service.health.snapshot().await.restore_incomplete.is_some());

    // The collector starts writing again
    write_three_shards(&data);
    assert!(service.aggregate().await.unwrap().completed().is_some());
    let freshness = service.recovery.check_freshness().await;
    assert_eq!(freshness.status, LocalDataStatus::Healthy);

    let snapshot = service.health.snapshot().await;
    assert!(snapshot.restore_incomplete.is_none());
    assert!(snapshot.last_aggregation_error.is_none());
    assert_eq!(snapshot.reasons, vec!["no backup providers available".to_string()]);
}
