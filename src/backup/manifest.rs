//! Backup manifests and the object key layout
//!
//! ```text
//! <prefix>/csv/<run-date>/<HH-MM-SS-mmm>/<shard file>
//! <prefix>/json/<run-date>/<HH-MM-SS-mmm>/<artifact file>
//! <prefix>/<run-date>/<HH-MM-SS-mmm>/backup-summary.json
//! ```
//!
//! Objects are written once, under the run that sent them, and never replaced.

use chrono::{DateTime, NaiveDate, Duration, NaiveTime, SubsecRound, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::shard::ShardId;

pub const MANIFEST_FILE: &str = "backup-summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Raw shard, restored into the data directory
    Csv,
    /// Derived artifact, restored into the artifact directory
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Succeeded,
    Failed,
}

/// Outcome of one file on one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    pub provider: String,
    pub status: FileStatus,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

/// One file of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File name relative to its local directory
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub sha256: String,
    /// Succeeded if any provider accepted the file
    pub status: FileStatus,
    pub outcomes: Vec<ProviderOutcome>,
}

/// Per-run record, written once after every upload attempt finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub run_timestamp: DateTime<Utc>,
    pub trigger: String,
    pub files_attempted: usize,
    pub files_succeeded: usize,
    pub files_failed: usize,
    /// The run stopped early on shutdown; files not attempted are absent
    #[serde(default)]
    pub interrupted: bool,
    pub providers: Vec<String>,
    pub files: Vec<FileRecord>,
}

impl BackupManifest {
    pub fn new(run_timestamp: DateTime<Utc>, trigger: &str, providers: Vec<String>, files: Vec<FileRecord>) -> Self {
        let files_succeeded = files
            .iter()
            .filter(|f| f.status == FileStatus::Succeeded)
            .count();
        Self {
            run_timestamp,
            trigger: trigger.to_string(),
            files_attempted: files.len(),
            files_succeeded,
            files_failed: files.len() - files_succeeded,
            interrupted: false,
            providers,
            files,
        }
    }

    /// Files this provider accepted, with the key it stored them under
    pub fn succeeded_for<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = (&'a FileRecord, &'a ProviderOutcome)> + 'a {
        self.files.iter().filter_map(move |file| {
            file.outcomes
                .iter()
                .find(|o| o.provider == provider && o.status == FileStatus::Succeeded)
                .map(|o| (file, o))
        })
    }

    pub fn is_success(&self) -> bool {
        self.files_failed == 0
    }
}

/// Identity of one run: its start time at millisecond precision. Every object
/// a run writes lives under this segment, so no run overwrites another's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(DateTime<Utc>);

impl RunId {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self(at.trunc_subsecs(3))
    }

    /// Id for a run starting at `now` that sorts strictly after `previous`
    pub fn next_after(now: DateTime<Utc>, previous: Option<RunId>) -> Self {
        let id = Self::at(now);
        match previous {
            Some(prev) if id <= prev => Self(prev.0 + Duration::milliseconds(1)),
            _ => id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }

    /// `YYYY-MM-DD` and `HH-MM-SS-mmm`
    fn parse(date: &str, time: &str) -> Option<Self> {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        let parts: Vec<&str> = time.split('-').collect();
        let [h, m, s, ms] = parts.as_slice() else {
            return None;
        };
        let widths_ok = h.len() == 2 && m.len() == 2 && s.len() == 2 && ms.len() == 3;
        if !widths_ok {
            return None;
        }
        let time = NaiveTime::from_hms_milli_opt(h.parse().ok()?, m.parse().ok()?, s.parse().ok()?, ms.parse().ok()?)?;
        Some(Self(Utc.from_utc_datetime(&date.and_time(time))))
    }

    fn path(&self) -> String {
        format!(
            "{}/{:02}-{:02}-{:02}-{:03}",
            self.0.format("%Y-%m-%d"),
            self.0.hour(),
            self.0.minute(),
            self.0.second(),
            self.0.timestamp_subsec_millis()
        )
    }
}

/// Key construction and parsing for one prefix
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn join(&self, rest: &str) -> String {
        if self.prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{}", self.prefix, rest)
        }
    }

    /// Key relative to the prefix, if it lies under it
    fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            Some(key)
        } else {
            key.strip_prefix(&self.prefix)?.strip_prefix('/')
        }
    }

    pub fn root(&self) -> String {
        self.join("")
    }

    pub fn csv_prefix(&self) -> String {
        self.join("csv/")
    }

    pub fn shard_key(&self, run: RunId, file_name: &str) -> String {
        self.join(&format!("csv/{}/{}", run.path(), file_name))
    }

    pub fn artifact_key(&self, run: RunId, file_name: &str) -> String {
        self.join(&format!("json/{}/{}", run.path(), file_name))
    }

    pub fn manifest_key(&self, run: RunId) -> String {
        self.join(&format!("{}/{}", run.path(), MANIFEST_FILE))
    }

    /// Run of a manifest key
    pub fn manifest_run(&self, key: &str) -> Option<RunId> {
        let parts: Vec<&str> = self.strip(key)?.split('/').collect();
        match parts.as_slice() {
            [date, time, file] if *file == MANIFEST_FILE => RunId::parse(date, time),
            _ => None,
        }
    }

    /// Run of an artifact snapshot or manifest key. Shard keys have none since
    /// retention never prunes them.
    pub fn snapshot_run(&self, key: &str) -> Option<RunId> {
        let parts: Vec<&str> = self.strip(key)?.split('/').collect();
        match parts.as_slice() {
            ["json", date, time, _] => RunId::parse(date, time),
            [date, time, file] if *file == MANIFEST_FILE => RunId::parse(date, time),
            _ => None,
        }
    }

    /// Run and shard file name of a key under the csv prefix
    pub fn shard_object<'a>(&self, key: &'a str) -> Option<(RunId, &'a str)> {
        let parts: Vec<&str> = self.strip(key)?.split('/').collect();
        match parts.as_slice() {
            ["csv", date, time, name] => {
                let run = RunId::parse(date, time)?;
                ShardId::parse(name).ok().map(|_| (run, *name))
            }
            _ => None,
        }
    }
}
