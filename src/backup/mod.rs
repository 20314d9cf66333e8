//! Backup layer: provider capability, concrete providers, manifests and the
//! orchestrator that drives them.

pub mod local;
pub mod manifest;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod s3;
pub mod sync_db;

pub use local::LocalProvider;
pub use manifest::{BackupManifest, FileKind, FileRecord, FileStatus, KeyLayout, ProviderOutcome, RunId};
pub use orchestrator::{BackupOrchestrator, BackupRunReport, BackupSettings, BackupStats, BackupTrigger};
pub use provider::{BackupProvider, ObjectInfo, ProviderKind};
pub use registry::{ProviderRegistry, ProviderStatus};
pub use s3::S3Provider;
pub use sync_db::SyncDatabase;
