//! Local-disk backup provider

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use walkdir::WalkDir;

use super::provider::{BackupProvider, ObjectInfo, ProviderKind};
use crate::error::ProviderError;

/// Stores objects as files under a root directory
pub struct LocalProvider {
    name: String,
    root: PathBuf,
}

impl LocalProvider {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            name: "local".to_string(),
            root: root.into(),
        }
    }

    pub fn with_name<P: Into<PathBuf>>(name: &str, root: P) -> Self {
        Self {
            name: name.to_string(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path under the root, refusing anything that escapes it
    fn path_for(&self, key: &str) -> Result<PathBuf, ProviderError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(ProviderError::Permanent(format!("invalid object key {:?}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BackupProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn store(&self, key: &str, data: Bytes) -> Result<(), ProviderError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::from_io(key, &e))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.partial", file_name));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| ProviderError::from_io(key, &e))?;
        file.write_all(&data)
            .await
            .map_err(|e| ProviderError::from_io(key, &e))?;
        file.sync_all()
            .await
            .map_err(|e| ProviderError::from_io(key, &e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ProviderError::from_io(key, &e))?;

        debug!("Stored {} bytes at {:?}", data.len(), path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, ProviderError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<ObjectInfo>, ProviderError> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut objects = Vec::new();
            for entry in WalkDir::new(&root).into_iter() {
                let entry = entry.map_err(|e| ProviderError::Transient(format!("walking {:?}: {}", root, e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy().ends_with(".partial") {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&root) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(&prefix) {
                    continue;
                }
                let metadata = entry
                    .metadata()
                    .map_err(|e| ProviderError::Transient(format!("stat {}: {}", key, e)))?;
                objects.push(ObjectInfo {
                    key,
                    size: metadata.len(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
        .await
        .map_err(|e| ProviderError::Transient(format!("listing task failed: {}", e)))?
    }

    async fn fetch(&self, key: &str) -> Result<Bytes, ProviderError> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| ProviderError::from_io(key, &e))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ProviderError::from_io(key, &e)),
        }

        // Drop directories the deletion left empty
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.root || tokio::fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_fetch_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path());

        provider
            .store("btc-data/csv/2025-07-10/08/2025-07-10_08.csv", Bytes::from_static(b"a,b\n"))
            .await
            .unwrap();
        provider
            .store("btc-data/2025-07-10/09/backup-summary.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let fetched = provider
            .fetch("btc-data/csv/2025-07-10/08/2025-07-10_08.csv")
            .await
            .unwrap();
        assert_eq!(&fetched[..], b"a,b\n");

        let csv = provider.list("btc-data/csv/").await.unwrap();
        assert_eq!(csv.len(), 1);
        assert_eq!(csv[0].size, 4);
        assert_eq!(provider.list("btc-data/").await.unwrap().len(), 2);

        provider.delete("btc-data/2025-07-10/09/backup-summary.json").await.unwrap();
        provider.delete("btc-data/2025-07-10/09/backup-summary.json").await.unwrap();
        assert!(!dir.path().join("btc-data/2025-07-10").exists());
        assert!(dir.path().join("btc-data/csv").exists());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path());
        let err = provider.fetch("nope/file.json").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path().join("root"));
        let err = provider
            .store("../outside.json", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_list_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path().join("absent"));
        assert!(provider.list("").await.unwrap().is_empty());
    }
}
