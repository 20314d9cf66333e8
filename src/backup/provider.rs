//! Backup provider capability

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ProviderError;

/// Which medium a provider writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Remote,
}

/// One stored object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// One backup medium. Keys are `/`-separated and relative to the provider root.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Store bytes under `key`, replacing any previous object
    async fn store(&self, key: &str, data: Bytes) -> Result<(), ProviderError>;

    /// Every object whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, ProviderError>;

    /// Object content; `ProviderError::NotFound` if absent
    async fn fetch(&self, key: &str) -> Result<Bytes, ProviderError>;

    /// Used by retention; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), ProviderError>;
}
