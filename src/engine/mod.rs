//! Backup engine: the per-collection state machines and the shared
//! compress / upload / record pipeline behind them.

mod alerts;
mod pipeline;
mod restore;
mod slots;
mod snapshot;
mod stream;

pub use alerts::{Alert, AlertReporter};
pub use restore::{RestoreReader, RestoredArtifact};
pub use slots::{Phase, SlotStatus};
pub use snapshot::SnapshotManager;
pub use stream::StreamManager;

use crate::backend::BackendHandle;
use crate::codec::Codec;
use crate::core::{BackupError, BackupRecord, Result};
use crate::ledger::{AppendOutcome, BackupLedger};
use crate::schedule::ScheduleSpec;
use crate::source::CollectionSource;
use crate::version::VersionCoordinator;
use chrono::{DateTime, Utc};
use slots::SlotTable;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};

/// What one tick (or forced run) of a manager did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NotDue { next_due: DateTime<Utc> },
    /// A run for this collection was already in flight; the tick is dropped.
    Skipped,
    Suspended,
    Completed(BackupRecord),
    /// The ledger already held this artifact's deduplication key.
    AlreadyRecorded(BackupRecord),
    /// No committed delta is old enough to flush yet.
    NothingToFlush,
    Failed {
        error: BackupError,
        consecutive_failures: u32,
    },
    /// Shutdown was observed before the upload started.
    Cancelled,
}

impl TickOutcome {
    fn from_append(outcome: AppendOutcome) -> Self {
        if outcome.inserted {
            TickOutcome::Completed(outcome.record)
        } else {
            TickOutcome::AlreadyRecorded(outcome.record)
        }
    }

    pub fn record(&self) -> Option<&BackupRecord> {
        match self {
            TickOutcome::Completed(record) | TickOutcome::AlreadyRecorded(record) => Some(record),
            _ => None,
        }
    }

    /// The run reached a successful end state.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TickOutcome::Completed(_) | TickOutcome::AlreadyRecorded(_) | TickOutcome::NothingToFlush
        )
    }
}

/// Exclusive per-collection locks shared by the snapshot and stream managers.
#[derive(Debug, Default)]
pub struct CollectionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CollectionLocks {
    pub async fn acquire(&self, collection: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock()?;
            Arc::clone(locks.entry(collection.to_string()).or_default())
        };
        Ok(lock.lock_owned().await)
    }
}

/// Everything the managers share.
pub struct EngineContext {
    pub codec: Arc<Codec>,
    pub archive: BackendHandle,
    pub overwrite: BackendHandle,
    pub ledger: Arc<BackupLedger>,
    pub version: Arc<VersionCoordinator>,
    pub source: Arc<dyn CollectionSource>,
    pub alerts: Arc<AlertReporter>,
    pub locks: CollectionLocks,
    pub shutdown: watch::Receiver<bool>,
}

impl EngineContext {
    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown_requested() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Folds a run's result into the slot table and the alert log.
    ///
    /// Failures stay inside the collection and come back as
    /// [`TickOutcome::Failed`]; only process-fatal errors are returned as `Err`.
    fn settle(
        &self,
        slots: &SlotTable,
        collection: &str,
        operation: &'static str,
        now: DateTime<Utc>,
        result: Result<TickOutcome>,
        next_due: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        match result {
            Ok(outcome) => {
                slots.succeeded(collection, next_due)?;
                Ok(outcome)
            }
            Err(BackupError::Cancelled) => Ok(TickOutcome::Cancelled),
            Err(error) => {
                let consecutive_failures = slots.failed(collection, &error)?;
                self.alerts
                    .report(collection, operation, &error, consecutive_failures, now);
                if error.is_process_fatal() {
                    return Err(error);
                }
                Ok(TickOutcome::Failed {
                    error,
                    consecutive_failures,
                })
            }
        }
    }
}

/// Timestamp segment of artifact names: minute precision for calendar
/// cadences, second precision for numeric ones.
fn artifact_stamp(cadence: &ScheduleSpec, at: DateTime<Utc>) -> String {
    match cadence {
        ScheduleSpec::Named(_) => at.format("%Y_%m_%d_%H_%M").to_string(),
        ScheduleSpec::Every(_) => at.format("%Y_%m_%d_%H_%M_%S").to_string(),
    }
}
