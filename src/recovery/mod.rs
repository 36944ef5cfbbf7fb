//! Startup crash detection and catch-up.
//!
//! Every run writes a "started, not yet confirmed clean" marker before any
//! other work and clears it on clean shutdown. A marker left behind by an
//! earlier run means that run died; the supervisor then opens a crash record,
//! catches up every collection whose last backup is older than its cadence,
//! and closes the record only when all catch-ups succeed.

use crate::core::{BackupError, BackupKind, CrashRecord, Destination, Result};
use crate::engine::{SnapshotManager, StreamManager, TickOutcome};
use crate::ledger::{BackupLedger, CrashLedger};
use crate::schedule::ScheduleSpec;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{Level, event, info_span};
use tracing::Instrument;

/// A collection that needed an out-of-band backup.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchUp {
    pub collection: String,
    pub kind: BackupKind,
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryReport {
    pub run_id: String,
    /// The crash handled by this start, if any.
    pub crash: Option<CrashRecord>,
    pub catch_ups: Vec<CatchUp>,
    /// Backup Ledger records newer than the crash's last known good record,
    /// counted before catch-up: what the crashed run(s) still managed to store.
    pub records_since_last_good: u64,
    /// The crash record was closed.
    pub recovered: bool,
}

impl RecoveryReport {
    pub fn failed_catch_ups(&self) -> impl Iterator<Item = &CatchUp> {
        self.catch_ups.iter().filter(|c| !c.outcome.is_success())
    }
}

pub struct RecoverySupervisor {
    crash_ledger: Arc<CrashLedger>,
    backup_ledger: Arc<BackupLedger>,
    snapshot: Arc<SnapshotManager>,
    stream: Arc<StreamManager>,
}

impl RecoverySupervisor {
    pub fn new(
        crash_ledger: Arc<CrashLedger>,
        backup_ledger: Arc<BackupLedger>,
        snapshot: Arc<SnapshotManager>,
        stream: Arc<StreamManager>,
    ) -> Self {
        Self {
            crash_ledger,
            backup_ledger,
            snapshot,
            stream,
        }
    }

    /// Startup hook. Must run before the scheduler starts ticking.
    pub async fn start(&self, run_id: &str, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let span = info_span!("recovery", run_id);
        self.start_inner(run_id, now).instrument(span).await
    }

    async fn start_inner(&self, run_id: &str, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let previous = self.crash_ledger.unclean_run(Some(run_id)).await;

        let last_good = self.backup_ledger.last_record_id().await;
        self.crash_ledger
            .mark_run_started(run_id, now, last_good)
            .await?;

        let crash = match previous {
            Some(run) => {
                event!(
                    Level::WARN,
                    crashed_run = %run.run_id,
                    started_at = %run.started_at,
                    "previous run did not shut down cleanly"
                );
                Some(
                    self.crash_ledger
                        .record_crash(&run, Some(run_id), now)
                        .await?,
                )
            }
            None => self.crash_ledger.open_crash().await,
        };

        let Some(crash) = crash else {
            event!(Level::INFO, "previous run ended cleanly");
            return Ok(RecoveryReport {
                run_id: run_id.to_string(),
                crash: None,
                catch_ups: Vec::new(),
                records_since_last_good: 0,
                recovered: false,
            });
        };

        let records_since_last_good = self
            .backup_ledger
            .last_record_id()
            .await
            .saturating_sub(crash.last_known_good_record_id);
        event!(
            Level::INFO,
            crash_id = crash.crash_id,
            last_known_good_record_id = crash.last_known_good_record_id,
            records_since_last_good,
            "checking collections for catch-up"
        );

        let catch_ups = self.catch_up(now).await?;
        let all_succeeded = catch_ups.iter().all(|c| c.outcome.is_success());

        let crash = if all_succeeded {
            let closed = self
                .crash_ledger
                .mark_recovered(crash.crash_id, Utc::now().max(now))
                .await?;
            event!(
                Level::INFO,
                crash_id = closed.crash_id,
                catch_ups = catch_ups.len(),
                "recovered from unclean shutdown"
            );
            closed
        } else {
            event!(
                Level::ERROR,
                crash_id = crash.crash_id,
                failed = catch_ups.iter().filter(|c| !c.outcome.is_success()).count(),
                "catch-up incomplete, crash stays open until the next start"
            );
            crash
        };

        Ok(RecoveryReport {
            run_id: run_id.to_string(),
            recovered: !crash.is_open(),
            crash: Some(crash),
            catch_ups,
            records_since_last_good,
        })
    }

    async fn catch_up(&self, now: DateTime<Utc>) -> Result<Vec<CatchUp>> {
        let mut catch_ups = Vec::new();

        for collection in self.snapshot.collections() {
            if !self
                .gap_exceeds(collection, BackupKind::Full, self.snapshot.cadence(), now)
                .await?
            {
                continue;
            }
            let outcome = self.snapshot.capture_now(collection, now).await?;
            catch_ups.push(CatchUp {
                collection: collection.clone(),
                kind: BackupKind::Full,
                outcome,
            });
        }

        for collection in self.stream.collections() {
            if !self
                .gap_exceeds(collection, BackupKind::Incremental, self.stream.cadence(), now)
                .await?
            {
                continue;
            }
            let outcome = self.stream.flush_now(collection, now).await?;
            catch_ups.push(CatchUp {
                collection: collection.clone(),
                kind: BackupKind::Incremental,
                outcome,
            });
        }

        Ok(catch_ups)
    }

    /// True when the newest archive record of `kind` is older than one
    /// cadence window, or missing.
    ///
    /// Records written by the crashed run after its last known good record
    /// count too: they are complete artifacts, so the gap is measured from
    /// the newest one regardless of which run stored it.
    async fn gap_exceeds(
        &self,
        collection: &str,
        kind: BackupKind,
        cadence: &ScheduleSpec,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let window = TimeDelta::from_std(cadence.period())
            .map_err(|err| BackupError::InvalidScheduleSpec(format!("{}: {}", cadence, err)))?;
        Ok(match self
            .backup_ledger
            .latest_of(collection, kind, Destination::Archive)
            .await
        {
            Some(record) => now - record.created_at > window,
            None => true,
        })
    }
}
