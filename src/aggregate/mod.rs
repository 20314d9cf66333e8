//! Aggregation engine
//!
//! Regenerates the whole series from every shard on each pass: read shards in
//! parallel, merge with first-seen dedup, resample, annotate with moving
//! averages, then persist the artifacts. Only one pass runs at a time; a
//! trigger that arrives during a pass is coalesced into it.

pub mod artifacts;
pub mod indicators;
pub mod resample;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub use artifacts::{Metadata, TimeRange};
pub use indicators::{MovingAverage, ResampledPoint};

use crate::config::{AggregationConfig, MAX_RECENT_HOURS};
use crate::error::AggregateError;
use crate::shard::{ShardInfo, ShardStore};
use crate::RunOutcome;
use artifacts::BuildStats;
use resample::SampleMerger;

/// Ordered, deduplicated, indicator-annotated series
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalSeries {
    points: Vec<ResampledPoint>,
    windows: Vec<usize>,
}

impl HistoricalSeries {
    pub fn points(&self) -> &[ResampledPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        Some(TimeRange {
            start: self.points.first()?.time,
            end: self.points.last()?.time,
        })
    }

    /// Points within `hours` of the newest point. `hours` is clamped to the
    /// configurable range.
    pub fn recent(&self, hours: i64) -> &[ResampledPoint] {
        let newest = match self.points.last() {
            Some(p) => p.time,
            None => return &[],
        };
        let cutoff = newest - Duration::hours(hours.clamp(0, MAX_RECENT_HOURS));
        let start = self.points.partition_point(|p| p.time <= cutoff);
        &self.points[start..]
    }

    pub fn valid_counts(&self) -> BTreeMap<String, usize> {
        self.windows
            .iter()
            .map(|&window| {
                let count = self
                    .points
                    .iter()
                    .filter(|p| p.average(window).map(|ma| ma.valid).unwrap_or(false))
                    .count();
                (format!("ma_{}", window), count)
            })
            .collect()
    }

    /// Consecutive runs of points sharing a UTC date
    pub fn daily_groups(&self) -> Vec<(NaiveDate, &[ResampledPoint])> {
        let mut groups = Vec::new();
        let mut start = 0;
        for i in 1..=self.points.len() {
            let boundary = i == self.points.len()
                || self.points[i].time.date_naive() != self.points[start].time.date_naive();
            if boundary {
                groups.push((self.points[start].time.date_naive(), &self.points[start..i]));
                start = i;
            }
        }
        groups
    }
}

/// Settings the engine needs for one pass
#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub cadence_seconds: i64,
    pub windows: Vec<usize>,
    pub recent_hours: i64,
}

impl From<&AggregationConfig> for AggregationSettings {
    fn from(config: &AggregationConfig) -> Self {
        Self {
            cadence_seconds: config.cadence_seconds,
            windows: config.ma_windows.clone(),
            recent_hours: config.recent_hours,
        }
    }
}

/// Result of a completed pass
#[derive(Debug, Clone)]
pub struct AggregationReport {
    pub metadata: Metadata,
    pub changed_files: Vec<String>,
    pub duplicates_dropped: usize,
    pub finished_at: DateTime<Utc>,
}

/// Build the series from the given shards. Unreadable shards are skipped.
pub fn build_series(
    store: &ShardStore,
    shards: &[ShardInfo],
    settings: &AggregationSettings,
) -> (HistoricalSeries, BuildStats, usize) {
    let reads: Vec<_> = shards
        .par_iter()
        .map(|shard| (shard, store.read_shard(shard)))
        .collect();

    let mut merger = SampleMerger::new();
    let mut stats = BuildStats::default();
    for (shard, read) in reads {
        match read {
            Ok(samples) => {
                stats.shards_read += 1;
                merger.add_shard(samples, &shard.id.file_name);
            }
            Err(e) => {
                stats.shards_skipped += 1;
                warn!("Skipping shard {}: {}", shard.id.file_name, e);
            }
        }
    }

    let duplicates = merger.duplicates();
    let samples = merger.into_samples();
    let buckets = resample::resample(&samples, settings.cadence_seconds);
    let points = indicators::annotate(buckets, &settings.windows);

    debug!(
        "Built series: {} samples, {} duplicates dropped, {} points",
        samples.len(),
        duplicates,
        points.len()
    );

    (
        HistoricalSeries {
            points,
            windows: settings.windows.clone(),
        },
        stats,
        duplicates,
    )
}

/// One full pass, blocking. Leaves existing artifacts alone when there is nothing to write.
pub fn regenerate_blocking(
    store: &ShardStore,
    artifact_dir: &Path,
    settings: &AggregationSettings,
) -> Result<AggregationReport, AggregateError> {
    let shards = match store.list_shards() {
        Ok(shards) => shards,
        Err(e) => {
            warn!("Failed to list shards: {}", e);
            return Err(AggregateError::NoDataAvailable { shards_seen: 0 });
        }
    };

    let (series, stats, duplicates) = build_series(store, &shards, settings);
    if stats.shards_read == 0 || series.is_empty() {
        return Err(AggregateError::NoDataAvailable {
            shards_seen: shards.len(),
        });
    }

    let written = artifacts::write_all(
        artifact_dir,
        &series,
        settings.recent_hours,
        settings.cadence_seconds,
        stats,
    )?;

    Ok(AggregationReport {
        metadata: written.metadata,
        changed_files: written.changed,
        duplicates_dropped: duplicates,
        finished_at: Utc::now(),
    })
}

/// Process-wide aggregation engine
#[derive(Clone)]
pub struct AggregationEngine {
    store: ShardStore,
    artifact_dir: PathBuf,
    settings: AggregationSettings,
    run_lock: Arc<Mutex<()>>,
    last_metadata: Arc<RwLock<Option<Metadata>>>,
}

impl AggregationEngine {
    pub fn new(store: ShardStore, artifact_dir: PathBuf, settings: AggregationSettings) -> Self {
        let previous = Metadata::load(&artifact_dir);
        if let Some(meta) = &previous {
            debug!("Found metadata from {} with {} points", meta.generated_at, meta.total_points);
        }
        Self {
            store,
            artifact_dir,
            settings,
            run_lock: Arc::new(Mutex::new(())),
            last_metadata: Arc::new(RwLock::new(previous)),
        }
    }

    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Held for the length of a pass. Anything else that writes the artifacts
    /// takes it as well.
    pub fn writer_lock(&self) -> Arc<Mutex<()>> {
        self.run_lock.clone()
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Metadata of the last successful pass
    pub async fn last_metadata(&self) -> Option<Metadata> {
        self.last_metadata.read().await.clone()
    }

    /// Run one pass, or coalesce if a pass is already in flight
    pub async fn regenerate(&self) -> Result<RunOutcome<AggregationReport>, AggregateError> {
        let _guard = match self.run_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Aggregation already running, coalescing trigger");
                return Ok(RunOutcome::Coalesced);
            }
        };

        let store = self.store.clone();
        let dir = self.artifact_dir.clone();
        let settings = self.settings.clone();
        let started = std::time::Instant::now();

        let report = tokio::task::spawn_blocking(move || regenerate_blocking(&store, &dir, &settings))
            .await
            .map_err(|e| AggregateError::Join(e.to_string()))??;

        info!(
            "Aggregation complete in {:?}: {} points from {} shards ({} skipped)",
            started.elapsed(),
            report.metadata.total_points,
            report.metadata.shards_read,
            report.metadata.shards_skipped
        );
        *self.last_metadata.write().await = Some(report.metadata.clone());
        Ok(RunOutcome::Completed(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const HEADER: &str = "timestamp,price,bid,ask,spread,volume,spread_avg_L20,spread_avg_L20_pct\n";

    fn settings() -> AggregationSettings {
        AggregationSettings {
            cadence_seconds: 60,
            windows: vec![2, 3],
            recent_hours: 1,
        }
    }

    fn write_shard(dir: &Path, name: &str, rows: &[(&str, f64, f64)]) {
        let mut content = HEADER.to_string();
        for (ts, price, pct) in rows {
            content.push_str(&format!("{},{},0,0,0,0,0,{}\n", ts, price, pct));
        }
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_recent_is_relative_to_newest_point() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(
            dir.path(),
            "2025-07-10_00.csv",
            &[
                ("2025-07-10T00:00:00", 1.0, 0.1),
                ("2025-07-10T05:00:00", 2.0, 0.1),
                ("2025-07-10T05:30:00", 3.0, 0.1),
                ("2025-07-10T06:00:00", 4.0, 0.1),
            ],
        );
        let store = ShardStore::new(dir.path());
        let shards = store.list_shards().unwrap();
        let (series, stats, _) = build_series(&store, &shards, &settings());

        assert_eq!(stats.shards_read, 1);
        assert_eq!(series.len(), 4);
        let recent: Vec<f64> = series.recent(1).iter().map(|p| p.price).collect();
        assert_eq!(recent, vec![3.0, 4.0]);
        assert_eq!(series.recent(i64::MAX).len(), 4);
        assert!(series.recent(i64::MIN).is_empty());
    }

    #[test]
    fn test_daily_groups_split_on_utc_date() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(
            dir.path(),
            "2025-07-10_16.csv",
            &[("2025-07-10T23:58:00", 1.0, 0.1), ("2025-07-10T23:59:00", 2.0, 0.1)],
        );
        write_shard(dir.path(), "2025-07-11_00.csv", &[("2025-07-11T00:00:00", 3.0, 0.1)]);
        let store = ShardStore::new(dir.path());
        let shards = store.list_shards().unwrap();
        let (series, _, _) = build_series(&store, &shards, &settings());

        let groups = series.daily_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, NaiveDate::from_ymd_opt(2025, 7, 11).unwrap());
    }

    #[test]
    fn test_unreadable_shard_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "2025-07-10_00.csv", &[("2025-07-10T00:00:00", 1.0, 0.1)]);
        fs::write(dir.path().join("2025-07-10_08.csv"), "garbage,header\n1,2\n").unwrap();

        let store = ShardStore::new(dir.path());
        let report = regenerate_blocking(&store, dir.path(), &settings()).unwrap();
        assert_eq!(report.metadata.shards_read, 1);
        assert_eq!(report.metadata.shards_skipped, 1);
        assert_eq!(report.metadata.total_points, 1);
    }

    #[test]
    fn test_valid_counts_per_window() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(
            dir.path(),
            "2025-07-10_00.csv",
            &[
                ("2025-07-10T00:00:00", 1.0, 0.1),
                ("2025-07-10T00:01:00", 1.0, 0.1),
                ("2025-07-10T00:02:00", 1.0, 0.1),
                ("2025-07-10T00:03:00", 1.0, 0.1),
            ],
        );
        let store = ShardStore::new(dir.path());
        let report = regenerate_blocking(&store, dir.path(), &settings()).unwrap();
        assert_eq!(report.metadata.valid_counts["ma_2"], 3);
        assert_eq!(report.metadata.valid_counts["ma_3"], 2);
    }

    #[tokio::test]
    async fn test_engine_keeps_last_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), "2025-07-10_00.csv", &[("2025-07-10T00:00:00", 1.0, 0.1)]);
        let engine = AggregationEngine::new(ShardStore::new(dir.path()), dir.path().to_path_buf(), settings());
        assert!(engine.last_metadata().await.is_none());

        let outcome = engine.regenerate().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(engine.last_metadata().await.unwrap().total_points, 1);

        // A fresh engine picks the summary back up from disk
        let reopened = AggregationEngine::new(ShardStore::new(dir.path()), dir.path().to_path_buf(), settings());
        assert_eq!(reopened.last_metadata().await.unwrap().total_points, 1);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AggregationEngine::new(ShardStore::new(dir.path()), dir.path().to_path_buf(), settings());
        let _held = engine.run_lock.clone().try_lock_owned().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.regenerate().await.unwrap(), RunOutcome::Coalesced));
    }
}
