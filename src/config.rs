//! Configuration module for spread-vault
//!
//! Settings come from an optional YAML file and are then overridden from the
//! environment, so a deployment can run with nothing but environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Longest recent sub-series, ten years
pub const MAX_RECENT_HOURS: i64 = 24 * 366 * 10;
/// Longest staleness threshold, one year
pub const MAX_STALENESS_MINUTES: i64 = 60 * 24 * 366;
/// Coarsest resample cadence, one day
pub const MAX_CADENCE_SECONDS: i64 = 24 * 3600;
/// Longest period of any background loop, one week
pub const MAX_INTERVAL_SECONDS: u64 = 7 * 24 * 3600;

/// Shard and artifact locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the rotating shard files (e.g., "render_app/data")
    pub data_dir: PathBuf,
    /// Directory for derived artifacts; defaults to `data_dir`
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn artifact_dir(&self) -> &Path {
        self.artifact_dir.as_deref().unwrap_or(&self.data_dir)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            artifact_dir: None,
        }
    }
}

/// Aggregation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Seconds between scheduled regenerations
    #[serde(default = "default_aggregation_interval")]
    pub interval_seconds: u64,
    /// Resample cadence in seconds (one point per bucket)
    #[serde(default = "default_cadence")]
    pub cadence_seconds: i64,
    /// Rolling windows for the spread moving averages
    #[serde(default = "default_windows")]
    pub ma_windows: Vec<usize>,
    /// Length of the recent sub-series, measured back from the newest point
    #[serde(default = "default_recent_hours")]
    pub recent_hours: i64,
    /// Seconds between checks for a newly rotated shard
    #[serde(default = "default_rotation_check")]
    pub rotation_check_seconds: u64,
}

fn default_aggregation_interval() -> u64 {
    60
}

fn default_cadence() -> i64 {
    60
}

fn default_windows() -> Vec<usize> {
    vec![50, 100, 200]
}

fn default_recent_hours() -> i64 {
    24
}

fn default_rotation_check() -> u64 {
    30
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_aggregation_interval(),
            cadence_seconds: default_cadence(),
            ma_windows: default_windows(),
            recent_hours: default_recent_hours(),
            rotation_check_seconds: default_rotation_check(),
        }
    }
}

/// S3-compatible storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Provider type: "aws", "b2" (Backblaze B2), "r2" (Cloudflare R2), or "generic"
    #[serde(default = "default_s3_provider")]
    pub provider: String,
    /// S3 bucket name
    pub bucket: String,
    /// Access key ID
    #[serde(default)]
    pub access_key_id: String,
    /// Secret access key
    #[serde(default)]
    pub secret_access_key: String,
    /// Region (optional, will use provider defaults if not specified)
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint URL for S3-compatible services
    /// Examples:
    /// - Backblaze B2: "https://s3.us-west-002.backblazeb2.com"
    /// - Cloudflare R2: "https://<account-id>.r2.cloudflarestorage.com"
    /// - MinIO: "http://localhost:9000"
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Force path-style addressing (true for most S3-compatible services)
    #[serde(default)]
    pub force_path_style: Option<bool>,
}

fn default_s3_provider() -> String {
    "aws".to_string()
}

/// Backup orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_backup_interval")]
    pub interval_minutes: u64,
    /// Run groups kept by local-disk providers
    #[serde(default = "default_max_local_backups")]
    pub max_local_backups: usize,
    /// Root of the local-disk provider; `None` disables it
    #[serde(default = "default_local_dir")]
    pub local_dir: Option<PathBuf>,
    /// Key prefix shared by every provider
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// sled database holding fingerprints of backed-up files
    #[serde(default = "default_sync_db")]
    pub sync_db_path: PathBuf,
    /// In-run retries for transient store failures
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Consecutive ingestion errors that fire a critical backup
    #[serde(default = "default_critical_threshold")]
    pub critical_error_threshold: u32,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

fn default_true() -> bool {
    true
}

fn default_backup_interval() -> u64 {
    30
}

fn default_max_local_backups() -> usize {
    10
}

fn default_local_dir() -> Option<PathBuf> {
    Some(PathBuf::from("backup_data"))
}

fn default_prefix() -> String {
    "btc-data".to_string()
}

fn default_sync_db() -> PathBuf {
    PathBuf::from("state/backup-sync.db")
}

fn default_store_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_critical_threshold() -> u32 {
    5
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_backup_interval(),
            max_local_backups: default_max_local_backups(),
            local_dir: default_local_dir(),
            prefix: default_prefix(),
            sync_db_path: default_sync_db(),
            store_retries: default_store_retries(),
            retry_backoff_ms: default_retry_backoff(),
            critical_error_threshold: default_critical_threshold(),
            s3: None,
        }
    }
}

/// Startup recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub auto_restore_on_startup: bool,
    /// Local data older than this is considered stale
    #[serde(default = "default_staleness")]
    pub staleness_threshold_minutes: i64,
    /// Also fetch every backed-up raw shard missing locally
    #[serde(default = "default_true")]
    pub include_all_shards: bool,
    /// Seconds between freshness re-checks while serving
    #[serde(default = "default_health_interval")]
    pub health_check_seconds: u64,
}

fn default_staleness() -> i64 {
    120
}

fn default_health_interval() -> u64 {
    60
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_restore_on_startup: true,
            staleness_threshold_minutes: default_staleness(),
            include_all_shards: true,
            health_check_seconds: default_health_interval(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config = serde_yaml::from_str(&content)
            .context("Failed to parse config YAML")?;

        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        if let Some(dir) = env.get("DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env.get("ARTIFACT_DIR") {
            self.storage.artifact_dir = Some(PathBuf::from(dir));
        }

        env.parse_into("AGGREGATION_INTERVAL_SECONDS", &mut self.aggregation.interval_seconds)?;
        env.parse_into("RESAMPLE_CADENCE_SECONDS", &mut self.aggregation.cadence_seconds)?;
        env.parse_into("RECENT_HOURS", &mut self.aggregation.recent_hours)?;
        if let Some(windows) = env.get("MA_WINDOWS") {
            self.aggregation.ma_windows = parse_windows(&windows)?;
        }

        env.parse_flag("BACKUP_ENABLED", &mut self.backup.enabled);
        env.parse_into("BACKUP_INTERVAL_MINUTES", &mut self.backup.interval_minutes)?;
        env.parse_into("MAX_LOCAL_BACKUPS", &mut self.backup.max_local_backups)?;
        env.parse_into("CRITICAL_ERROR_THRESHOLD", &mut self.backup.critical_error_threshold)?;
        if let Some(dir) = env.get("LOCAL_BACKUP_DIR") {
            self.backup.local_dir = if dir.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(prefix) = env.get("BACKUP_PREFIX") {
            self.backup.prefix = prefix;
        }
        if let Some(path) = env.get("BACKUP_SYNC_DB") {
            self.backup.sync_db_path = PathBuf::from(path);
        }

        if let Some(bucket) = env.get("S3_BUCKET") {
            let s3 = self.backup.s3.get_or_insert_with(|| S3Config {
                provider: default_s3_provider(),
                bucket: String::new(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                region: None,
                endpoint: None,
                force_path_style: None,
            });
            s3.bucket = bucket;
        }
        if let Some(s3) = self.backup.s3.as_mut() {
            if let Some(provider) = env.get("S3_PROVIDER") {
                s3.provider = provider;
            }
            if let Some(key) = env.get("S3_ACCESS_KEY_ID") {
                s3.access_key_id = key;
            }
            if let Some(secret) = env.get("S3_SECRET_ACCESS_KEY") {
                s3.secret_access_key = secret;
            }
            if let Some(region) = env.get("S3_REGION") {
                s3.region = Some(region);
            }
            if let Some(endpoint) = env.get("S3_ENDPOINT") {
                s3.endpoint = Some(endpoint);
            }
            if let Some(raw) = env.get("S3_FORCE_PATH_STYLE") {
                s3.force_path_style = Some(is_truthy(&raw));
            }
        }

        env.parse_flag("AUTO_RESTORE_ON_STARTUP", &mut self.recovery.auto_restore_on_startup);
        env.parse_into(
            "STALENESS_THRESHOLD_MINUTES",
            &mut self.recovery.staleness_threshold_minutes,
        )?;

        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let cadence = self.aggregation.cadence_seconds;
        if !(1..=MAX_CADENCE_SECONDS).contains(&cadence) {
            anyhow::bail!("Resample cadence must be between 1 and {} seconds, got {}", MAX_CADENCE_SECONDS, cadence);
        }
        if self.aggregation.ma_windows.iter().any(|w| *w == 0) {
            anyhow::bail!("Moving-average windows must be positive");
        }
        let recent = self.aggregation.recent_hours;
        if !(1..=MAX_RECENT_HOURS).contains(&recent) {
            anyhow::bail!("Recent window must be between 1 and {} hours, got {}", MAX_RECENT_HOURS, recent);
        }
        let staleness = self.recovery.staleness_threshold_minutes;
        if !(1..=MAX_STALENESS_MINUTES).contains(&staleness) {
            anyhow::bail!(
                "Staleness threshold must be between 1 and {} minutes, got {}",
                MAX_STALENESS_MINUTES,
                staleness
            );
        }

        let periods = [
            ("Aggregation interval", self.aggregation.interval_seconds),
            ("Rotation check interval", self.aggregation.rotation_check_seconds),
            ("Health check interval", self.recovery.health_check_seconds),
            ("Backup interval", self.backup.interval_minutes.saturating_mul(60)),
        ];
        for (name, seconds) in periods {
            if !(1..=MAX_INTERVAL_SECONDS).contains(&seconds) {
                anyhow::bail!("{} must be between 1 second and {} seconds, got {}", name, MAX_INTERVAL_SECONDS, seconds);
            }
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_into<T>(&self, name: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(name) {
            *target = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", name, raw, e))?;
        }
        Ok(())
    }

    fn parse_flag(&self, name: &str, target: &mut bool) {
        if let Some(raw) = self.get(name) {
            *target = is_truthy(&raw);
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn parse_windows(raw: &str) -> Result<Vec<usize>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .context(format!("Invalid moving-average window: {:?}", s))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_parsing() {
        let yaml = r#"
storage:
  data_dir: "/srv/data"
aggregation:
  cadence_seconds: 30
  ma_windows: [5, 10]
backup:
  interval_minutes: 15
  s3:
    provider: "r2"
    bucket: "spread-archive"
    access_key_id: "key"
    secret_access_key: "secret"
    endpoint: "https://account.r2.cloudflarestorage.com"
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/srv/data"));
        assert_eq!(config.storage.artifact_dir(), Path::new("/srv/data"));
        assert_eq!(config.aggregation.cadence_seconds, 30);
        assert_eq!(config.aggregation.ma_windows, vec![5, 10]);
        assert_eq!(config.aggregation.recent_hours, 24);
        assert_eq!(config.backup.interval_minutes, 15);
        assert_eq!(config.backup.max_local_backups, 10);
        assert_eq!(config.backup.s3.as_ref().unwrap().provider, "r2");
        assert!(config.recovery.auto_restore_on_startup);
    }

    #[test]
    fn test_config_parsing_empty_document() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.aggregation.ma_windows, vec![50, 100, 200]);
        assert_eq!(config.recovery.staleness_threshold_minutes, 120);
        assert!(config.backup.s3.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[
                ("DATA_DIR", "/var/lib/spread"),
                ("BACKUP_ENABLED", "no"),
                ("BACKUP_INTERVAL_MINUTES", "5"),
                ("MAX_LOCAL_BACKUPS", "3"),
                ("MA_WINDOWS", "20, 40"),
                ("STALENESS_THRESHOLD_MINUTES", "45"),
                ("S3_BUCKET", "archive"),
                ("S3_ACCESS_KEY_ID", "id"),
                ("S3_SECRET_ACCESS_KEY", "secret"),
                ("S3_FORCE_PATH_STYLE", "true"),
            ]))
            .unwrap();

        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/spread"));
        assert!(!config.backup.enabled);
        assert_eq!(config.backup.interval_minutes, 5);
        assert_eq!(config.backup.max_local_backups, 3);
        assert_eq!(config.aggregation.ma_windows, vec![20, 40]);
        assert_eq!(config.recovery.staleness_threshold_minutes, 45);

        let s3 = config.backup.s3.unwrap();
        assert_eq!(s3.bucket, "archive");
        assert_eq!(s3.provider, "aws");
        assert_eq!(s3.access_key_id, "id");
        assert_eq!(s3.force_path_style, Some(true));
    }

    #[test]
    fn test_env_rejects_garbage_numbers() {
        let mut config = Config::default();
        let err = config
            .apply_env(lookup(&[("BACKUP_INTERVAL_MINUTES", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("BACKUP_INTERVAL_MINUTES"));
    }

    #[test]
    fn test_local_backup_can_be_disabled() {
        let mut config = Config::default();
        config.apply_env(lookup(&[("LOCAL_BACKUP_DIR", "none")])).unwrap();
        assert!(config.backup.local_dir.is_none());
    }

    #[test]
    fn test_validate_bounds_durations() {
        assert!(Config::default().validate().is_ok());

        let huge = i64::MAX.to_string();
        for (name, value) in [
            ("RECENT_HOURS", huge.as_str()),
            ("RECENT_HOURS", "-3"),
            ("STALENESS_THRESHOLD_MINUTES", huge.as_str()),
            ("STALENESS_THRESHOLD_MINUTES", "0"),
            ("RESAMPLE_CADENCE_SECONDS", huge.as_str()),
            ("BACKUP_INTERVAL_MINUTES", "0"),
            ("BACKUP_INTERVAL_MINUTES", "307445734561825860"),
        ] {
            let mut config = Config::default();
            config.apply_env(lookup(&[(name, value)])).unwrap();
            assert!(config.validate().is_err(), "{}={} should be rejected", name, value);
        }

        let mut config = Config::default();
        config.recovery.health_check_seconds = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .apply_env(lookup(&[("RECENT_HOURS", "48"), ("STALENESS_THRESHOLD_MINUTES", "30")]))
            .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = Config::default();
        config.aggregation.ma_windows = vec![10, 0];
        assert!(config.validate().is_err());
    }
}
