//! Process-scoped provider registry
//!
//! Providers are built once at startup. A provider that fails to build, or
//! later reports a permanent failure, is kept in the registry as unavailable
//! so status can report it, but is skipped by every run.

use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::local::LocalProvider;
use super::provider::{BackupProvider, ProviderKind};
use super::s3::S3Provider;
use crate::config::BackupConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: Option<ProviderKind>,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct Entry {
    name: String,
    provider: Option<Arc<dyn BackupProvider>>,
    unavailable: RwLock<Option<String>>,
}

impl Entry {
    fn reason(&self) -> Option<String> {
        self.unavailable
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<Entry>,
}

impl ProviderRegistry {
    /// Build every configured provider. Never fails; failures become unavailable entries.
    pub async fn initialize(config: &BackupConfig) -> Self {
        let mut registry = Self::default();

        if let Some(dir) = &config.local_dir {
            info!("Local backup provider at {:?}", dir);
            registry.add(Arc::new(LocalProvider::new(dir.clone())));
        }

        if let Some(s3) = &config.s3 {
            match S3Provider::connect(s3).await {
                Ok(provider) => registry.add(Arc::new(provider)),
                Err(e) => {
                    warn!("S3 provider for bucket {:?} unavailable: {:#}", s3.bucket, e);
                    registry.add_failed(&format!("s3:{}", s3.bucket), &format!("{:#}", e));
                }
            }
        }

        if registry.entries.is_empty() {
            warn!("No backup providers configured");
        }
        registry
    }

    pub fn from_providers(providers: Vec<Arc<dyn BackupProvider>>) -> Self {
        let mut registry = Self::default();
        for provider in providers {
            registry.add(provider);
        }
        registry
    }

    pub fn add(&mut self, provider: Arc<dyn BackupProvider>) {
        self.entries.push(Entry {
            name: provider.name().to_string(),
            provider: Some(provider),
            unavailable: RwLock::new(None),
        });
    }

    /// Record a provider that could not be constructed
    pub fn add_failed(&mut self, name: &str, reason: &str) {
        self.entries.push(Entry {
            name: name.to_string(),
            provider: None,
            unavailable: RwLock::new(Some(reason.to_string())),
        });
    }

    /// Exclude a provider for the rest of the process lifetime
    pub fn mark_unavailable(&self, name: &str, reason: &str) {
        for entry in self.entries.iter().filter(|e| e.name == name) {
            let mut slot = entry
                .unavailable
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                warn!("Marking provider {} unavailable: {}", name, reason);
                *slot = Some(reason.to_string());
            }
        }
    }

    /// Usable providers in configuration order
    pub fn available(&self) -> Vec<Arc<dyn BackupProvider>> {
        self.entries
            .iter()
            .filter(|e| e.reason().is_none())
            .filter_map(|e| e.provider.clone())
            .collect()
    }

    /// Usable providers for restore: remote before local
    pub fn restore_order(&self) -> Vec<Arc<dyn BackupProvider>> {
        let mut providers = self.available();
        providers.sort_by_key(|p| match p.kind() {
            ProviderKind::Remote => 0,
            ProviderKind::Local => 1,
        });
        providers
    }

    pub fn any_available(&self) -> bool {
        !self.available().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.entries
            .iter()
            .map(|e| {
                let reason = e.reason();
                ProviderStatus {
                    name: e.name.clone(),
                    kind: e.provider.as_ref().map(|p| p.kind()),
                    available: reason.is_none() && e.provider.is_some(),
                    reason,
                }
            })
            .collect()
    }
}
