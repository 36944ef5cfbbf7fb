// ============================================================================
// TradeVault Library
// ============================================================================

//! Backup and snapshot lifecycle engine for a continuously running
//! market-data collector.
//!
//! Full snapshots and incremental delta flushes of live collections are
//! compressed, shipped to a local or object-store backend, and recorded in a
//! durable ledger. A crash ledger with run markers lets the next start detect
//! an unclean shutdown and catch up before normal scheduling resumes.

pub mod backend;
pub mod codec;
pub mod config;
pub mod core;
pub mod engine;
pub mod ledger;
pub mod recovery;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod version;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendHandle, BackendTarget, LocalTarget, ObjectStoreTarget, UploadPolicy};
pub use codec::{Codec, CompressionAlgorithm, CompressionConfig};
pub use config::{CollectorConfig, Environment, ScheduleProfile};
pub use core::{
    BackendKind, BackupError, BackupKind, BackupRecord, CommittedDelta, CrashRecord, Destination,
    ErrorKind, Location, NewBackupRecord, Result,
};
pub use engine::{
    Alert, AlertReporter, EngineContext, RestoreReader, RestoredArtifact, SnapshotManager,
    StreamManager, TickOutcome,
};
pub use ledger::{BackupLedger, CrashLedger};
pub use recovery::{RecoveryReport, RecoverySupervisor};
pub use schedule::{NamedCadence, ScheduleSpec, resolve};
pub use scheduler::Scheduler;
pub use service::BackupService;
pub use source::{CollectionSource, DirectorySource, MemorySource};
pub use version::{VersionCoordinator, VersionState};
