//! Shard store
//!
//! Read-only view over the rotating CSV files the collector appends to. Each
//! shard covers a fixed window encoded in its file name (`YYYY-MM-DD_HH.csv`).
//! Listing only touches file metadata; content is read one shard at a time.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::ShardError;

/// Length of one shard window; the collector rotates at 00, 08 and 16 UTC
pub const SHARD_WINDOW_HOURS: i64 = 8;

/// One ingested observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
    pub spread_pct: f64,
}

/// Row layout written by the collector; extra columns are ignored
#[derive(Debug, Deserialize)]
struct RawRow {
    timestamp: String,
    price: f64,
    #[serde(default)]
    bid: f64,
    #[serde(default)]
    ask: f64,
    #[serde(default)]
    spread: f64,
    #[serde(default)]
    volume: f64,
    #[serde(alias = "spread_avg_L20_pct")]
    spread_pct: f64,
}

/// Shard identity: the start of its window
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ShardId {
    pub window_start: DateTime<Utc>,
    pub file_name: String,
}

impl ShardId {
    /// Parse a shard file name such as `2025-07-10_08.csv`
    pub fn parse(file_name: &str) -> Result<Self, ShardError> {
        let invalid = || ShardError::InvalidName(file_name.to_string());

        let stem = file_name
            .strip_suffix(".csv")
            .ok_or_else(invalid)?;
        let (date_part, hour_part) = stem.split_once('_').ok_or_else(invalid)?;
        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|_| invalid())?;
        if hour_part.len() != 2 {
            return Err(invalid());
        }
        let hour: u32 = hour_part.parse().map_err(|_| invalid())?;
        let start = date.and_hms_opt(hour, 0, 0).ok_or_else(invalid)?;

        Ok(Self {
            window_start: Utc.from_utc_datetime(&start),
            file_name: file_name.to_string(),
        })
    }

    /// File name of the shard whose window contains `at`
    pub fn file_name_for(at: DateTime<Utc>) -> String {
        let hour = (at.hour() as i64 / SHARD_WINDOW_HOURS) * SHARD_WINDOW_HOURS;
        format!("{}_{:02}.csv", at.format("%Y-%m-%d"), hour)
    }
}

/// Shard metadata, available without reading content
#[derive(Debug, Clone, Serialize)]
pub struct ShardInfo {
    pub id: ShardId,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Read-only view over the shard directory
#[derive(Debug, Clone)]
pub struct ShardStore {
    dir: PathBuf,
}

impl ShardStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every shard in the store, oldest window first. Never filtered by date.
    pub fn list_shards(&self) -> Result<Vec<ShardInfo>, ShardError> {
        if !self.dir.exists() {
            debug!("Shard directory {:?} does not exist yet", self.dir);
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| ShardError::Unreadable {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;

        let mut shards = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if !file_name.ends_with(".csv") {
                continue;
            }
            let id = match ShardId::parse(&file_name) {
                Ok(id) => id,
                Err(_) => {
                    debug!("Ignoring non-shard CSV file {}", file_name);
                    continue;
                }
            };
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Failed to stat shard {}: {}", file_name, e);
                    continue;
                }
            };
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            shards.push(ShardInfo {
                id,
                path,
                size: metadata.len(),
                modified,
            });
        }

        shards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(shards)
    }

    /// Opt-in filter: shards whose file changed after `since`
    pub fn list_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<ShardInfo>, ShardError> {
        Ok(self
            .list_shards()?
            .into_iter()
            .filter(|s| s.modified > since)
            .collect())
    }

    /// Opt-in filter: shards whose window starts at or after `since`
    pub fn list_windows_since(&self, since: DateTime<Utc>) -> Result<Vec<ShardInfo>, ShardError> {
        Ok(self
            .list_shards()?
            .into_iter()
            .filter(|s| s.id.window_start >= since)
            .collect())
    }

    /// Newest shard by window, usually the active one
    pub fn newest(&self) -> Result<Option<ShardInfo>, ShardError> {
        Ok(self.list_shards()?.pop())
    }

    /// Read all complete records of one shard
    pub fn read_shard(&self, shard: &ShardInfo) -> Result<Vec<Sample>, ShardError> {
        let bytes = fs::read(&shard.path).map_err(|e| ShardError::Unreadable {
            path: shard.path.clone(),
            reason: e.to_string(),
        })?;
        parse_shard(&bytes, &shard.path)
    }
}

/// Parse shard content. A final line without a terminator is a record the
/// collector is still writing and is dropped.
pub fn parse_shard(bytes: &[u8], path: &Path) -> Result<Vec<Sample>, ShardError> {
    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(pos) => &bytes[..=pos],
        None => &bytes[..0],
    };
    if complete.len() < bytes.len() {
        debug!(
            "Dropping {} bytes of unterminated tail in {:?}",
            bytes.len() - complete.len(),
            path
        );
    }
    if complete.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(complete);

    let headers = reader.headers().map_err(|e| ShardError::Unreadable {
        path: path.to_path_buf(),
        reason: format!("bad header: {}", e),
    })?;
    if !headers.iter().any(|h| h == "timestamp") {
        return Err(ShardError::Unreadable {
            path: path.to_path_buf(),
            reason: "header has no timestamp column".to_string(),
        });
    }

    let mut samples = Vec::new();
    let mut rejected = 0usize;
    for (row_num, row) in reader.deserialize::<RawRow>().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                rejected += 1;
                debug!("Row {} of {:?} failed to parse ({}), skipping", row_num + 1, path, e);
                continue;
            }
        };
        let timestamp = match parse_timestamp(&row.timestamp) {
            Some(ts) => ts,
            None => {
                rejected += 1;
                debug!("Row {} of {:?} has bad timestamp {:?}, skipping", row_num + 1, path, row.timestamp);
                continue;
            }
        };
        if !row.price.is_finite() || !row.spread_pct.is_finite() {
            rejected += 1;
            continue;
        }
        samples.push(Sample {
            timestamp,
            price: row.price,
            bid: row.bid,
            ask: row.ask,
            spread: row.spread,
            volume: row.volume,
            spread_pct: row.spread_pct,
        });
    }

    if rejected > 0 {
        warn!("Skipped {} malformed rows in {:?}", rejected, path);
    }
    Ok(samples)
}

/// Parse an ISO-8601 timestamp; values without an offset are UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HEADER: &str = "timestamp,asset,exchange,price,bid,ask,spread,volume,spread_avg_L20,spread_avg_L20_pct\n";

    #[test]
    fn test_shard_id_parsing() {
        let id = ShardId::parse("2025-07-10_08.csv").unwrap();
        assert_eq!(id.window_start, Utc.with_ymd_and_hms(2025, 7, 10, 8, 0, 0).unwrap());

        assert!(ShardId::parse("2025-07-10.csv").is_err());
        assert!(ShardId::parse("2025-07-10_8.csv").is_err());
        assert!(ShardId::parse("2025-07-10_25.csv").is_err());
        assert!(ShardId::parse("notes.csv").is_err());
    }

    #[test]
    fn test_file_name_for_rotation_block() {
        let at = Utc.with_ymd_and_hms(2025, 7, 10, 15, 59, 59).unwrap();
        assert_eq!(ShardId::file_name_for(at), "2025-07-10_08.csv");
        let at = Utc.with_ymd_and_hms(2025, 7, 10, 16, 0, 0).unwrap();
        assert_eq!(ShardId::file_name_for(at), "2025-07-10_16.csv");
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2025, 7, 10, 12, 0, 1).unwrap();
        assert_eq!(parse_timestamp("2025-07-10T12:00:01"), Some(expected));
        assert_eq!(parse_timestamp("2025-07-10 12:00:01"), Some(expected));
        assert_eq!(parse_timestamp("2025-07-10T12:00:01Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-07-10T14:00:01+02:00"), Some(expected));
        assert!(parse_timestamp("2025-07-10T12:00:01.250000").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_parse_drops_torn_tail() {
        let content = format!(
            "{}2025-07-10T12:00:00,BTC-USD,Coinbase,100.0,99.5,100.5,1.0,3.0,1.2,0.012\n2025-07-10T12:00:01,BTC-USD,Coin",
            HEADER
        );
        let samples = parse_shard(content.as_bytes(), Path::new("t.csv")).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].price, 100.0);
        assert_eq!(samples[0].spread_pct, 0.012);
        assert_eq!(samples[0].bid, 99.5);
    }

    #[test]
    fn test_parse_skips_malformed_rows() {
        let content = format!(
            "{}2025-07-10T12:00:00,BTC-USD,Coinbase,100.0,99.5,100.5,1.0,3.0,1.2,0.012\nnot-a-time,BTC-USD,Coinbase,1,1,1,1,1,1,1\n2025-07-10T12:00:02,BTC-USD,Coinbase,abc,1,1,1,1,1,1\n2025-07-10T12:00:03,BTC-USD,Coinbase,101.0,100.5,101.5,1.0,3.0,1.2,0.011\n",
            HEADER
        );
        let samples = parse_shard(content.as_bytes(), Path::new("t.csv")).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].price, 101.0);
    }

    #[test]
    fn test_parse_requires_timestamp_header() {
        let content = "price,spread_pct\n1.0,0.1\n";
        let err = parse_shard(content.as_bytes(), Path::new("t.csv")).unwrap_err();
        assert!(matches!(err, ShardError::Unreadable { .. }));
    }

    #[test]
    fn test_parse_accepts_short_schema() {
        let content = "timestamp,price,spread_pct\n2025-07-10T12:00:00,100.0,0.02\n";
        let samples = parse_shard(content.as_bytes(), Path::new("t.csv")).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].volume, 0.0);
    }

    #[test]
    fn test_empty_and_header_only_shards() {
        assert!(parse_shard(b"", Path::new("t.csv")).unwrap().is_empty());
        assert!(parse_shard(HEADER.as_bytes(), Path::new("t.csv")).unwrap().is_empty());
    }

    #[test]
    fn test_list_shards_orders_by_window_and_ignores_others() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2025-07-11_00.csv"), HEADER).unwrap();
        fs::write(dir.path().join("2025-07-10_16.csv"), HEADER).unwrap();
        fs::write(dir.path().join("2024-01-01_08.csv"), HEADER).unwrap();
        fs::write(dir.path().join("export.csv"), HEADER).unwrap();
        fs::write(dir.path().join("historical.json"), "[]").unwrap();

        let store = ShardStore::new(dir.path());
        let names: Vec<String> = store
            .list_shards()
            .unwrap()
            .into_iter()
            .map(|s| s.id.file_name)
            .collect();
        assert_eq!(names, vec!["2024-01-01_08.csv", "2025-07-10_16.csv", "2025-07-11_00.csv"]);
        assert_eq!(store.newest().unwrap().unwrap().id.file_name, "2025-07-11_00.csv");
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path().join("absent"));
        assert!(store.list_shards().unwrap().is_empty());
    }

    #[test]
    fn test_opt_in_filters() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2025-07-10_00.csv"), HEADER).unwrap();
        fs::write(dir.path().join("2025-07-10_08.csv"), HEADER).unwrap();
        let store = ShardStore::new(dir.path());

        let since = Utc.with_ymd_and_hms(2025, 7, 10, 8, 0, 0).unwrap();
        let windows = store.list_windows_since(since).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].id.file_name, "2025-07-10_08.csv");

        let future = Utc::now() + chrono::Duration::from_std(Duration::from_secs(3600)).unwrap();
        assert!(store.list_modified_since(future).unwrap().is_empty());
        assert_eq!(store.list_shards().unwrap().len(), 2);
    }
}
