//! Fingerprints of files already backed up
//!
//! A sled tree keyed by provider and local file name. A file whose SHA-256
//! matches the fingerprint stored for a provider is not sent to it again.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::BackupError;

/// What was last backed up for one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub path: String,
    pub key: String,
    pub size: u64,
    pub sha256: String,
    /// Unix time of the run that stored it
    pub last_sync: i64,
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub struct SyncDatabase {
    db: sled::Db,
}

fn entry_key(provider: &str, path: &str) -> Vec<u8> {
    format!("{}::{}", provider, path).into_bytes()
}

impl SyncDatabase {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, BackupError> {
        let db = sled::open(db_path.as_ref()).map_err(|e| {
            BackupError::SyncDb(format!("failed to open {:?}: {}", db_path.as_ref(), e))
        })?;
        Ok(Self { db })
    }

    /// In-memory database, nothing persisted
    pub fn temporary() -> Result<Self, BackupError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| BackupError::SyncDb(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn get(&self, provider: &str, path: &str) -> Result<Option<Fingerprint>, BackupError> {
        match self.db.get(entry_key(provider, path)).map_err(|e| BackupError::SyncDb(e.to_string()))? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| BackupError::SyncDb(format!("corrupt entry for {}: {}", path, e))),
            None => Ok(None),
        }
    }

    pub fn set(&self, provider: &str, fingerprint: &Fingerprint) -> Result<(), BackupError> {
        let data = serde_json::to_vec(fingerprint)?;
        self.db
            .insert(entry_key(provider, &fingerprint.path), data)
            .map_err(|e| BackupError::SyncDb(e.to_string()))?;
        Ok(())
    }

    /// True when the stored fingerprint differs or is absent
    pub fn has_changed(&self, provider: &str, path: &str, sha256: &str) -> Result<bool, BackupError> {
        Ok(self.get(provider, path)?.map(|f| f.sha256 != sha256).unwrap_or(true))
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) -> Result<(), BackupError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| BackupError::SyncDb(e.to_string()))
    }
}
