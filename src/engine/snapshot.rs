use super::pipeline::Artifact;
use super::slots::{Admission, PhaseGuard, SlotStatus, SlotTable};
use super::{EngineContext, TickOutcome, artifact_stamp};
use crate::core::{BackupError, BackupKind, Destination, Result};
use crate::schedule::{ScheduleSpec, resolve};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{Level, event};

/// Full point-in-time copies of collections, on the snapshot cadence to the
/// archive destination, and at most once per minimum age to the overwrite
/// destination.
pub struct SnapshotManager {
    ctx: Arc<EngineContext>,
    cadence: ScheduleSpec,
    collections: Vec<String>,
    overwrite_collections: Vec<String>,
    overwrite_min_age: TimeDelta,
    slots: Arc<SlotTable>,
    overwrite_slots: Arc<SlotTable>,
}

impl SnapshotManager {
    pub fn new(
        ctx: Arc<EngineContext>,
        cadence: ScheduleSpec,
        collections: Vec<String>,
        overwrite_collections: Vec<String>,
        overwrite_min_age_secs: u64,
    ) -> Result<Self> {
        let overwrite_min_age = i64::try_from(overwrite_min_age_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                BackupError::ConfigError(format!(
                    "overwrite_min_age_secs {} is out of range",
                    overwrite_min_age_secs
                ))
            })?;
        Ok(Self {
            ctx,
            cadence,
            collections,
            overwrite_collections,
            overwrite_min_age,
            slots: SlotTable::new(),
            overwrite_slots: SlotTable::new(),
        })
    }

    pub fn cadence(&self) -> &ScheduleSpec {
        &self.cadence
    }

    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub fn overwrite_collections(&self) -> &[String] {
        &self.overwrite_collections
    }

    pub fn status(&self, collection: &str) -> Result<SlotStatus> {
        self.slots.status(collection)
    }

    pub fn overwrite_status(&self, collection: &str) -> Result<SlotStatus> {
        self.overwrite_slots.status(collection)
    }

    /// Lifts a suspension left by a fatal backend error.
    pub fn resume(&self, collection: &str) -> Result<bool> {
        let archive = self.slots.resume(collection)?;
        let overwrite = self.overwrite_slots.resume(collection)?;
        Ok(archive || overwrite)
    }

    /// Scheduler entry point: captures `collection` if it is due.
    pub async fn tick(&self, collection: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.ensure_known(collection, &self.collections)?;
        if self.slots.needs_schedule(collection)? {
            let first_due = match self
                .ctx
                .ledger
                .latest_of(collection, BackupKind::Full, Destination::Archive)
                .await
            {
                Some(record) => resolve(&self.cadence, record.created_at)?,
                None => now,
            };
            self.slots.set_next_due(collection, first_due)?;
        }
        self.run(collection, now, false).await
    }

    /// Out-of-band capture that ignores the due time. Still dropped when a
    /// capture of the collection is already in flight.
    pub async fn capture_now(&self, collection: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.ensure_known(collection, &self.collections)?;
        self.run(collection, now, true).await
    }

    async fn run(&self, collection: &str, now: DateTime<Utc>, force: bool) -> Result<TickOutcome> {
        let next_due = resolve(&self.cadence, now)?;
        let (guard, due_at) = match self.slots.try_begin(collection, now, force)? {
            Admission::NotDue(next_due) => return Ok(TickOutcome::NotDue { next_due }),
            Admission::Busy => {
                event!(Level::DEBUG, collection, "snapshot already in flight, tick dropped");
                return Ok(TickOutcome::Skipped);
            }
            Admission::Suspended => return Ok(TickOutcome::Suspended),
            Admission::Started { guard, due_at } => (guard, due_at),
        };

        let result = self.capture(guard, collection, due_at, now).await;
        self.ctx
            .settle(&self.slots, collection, "snapshot", now, result, next_due)
    }

    async fn capture(
        &self,
        guard: PhaseGuard,
        collection: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let _lock = self.ctx.locks.acquire(collection).await?;
        self.ctx.ensure_running()?;

        let payload = self.ctx.source.read_consistent_snapshot(collection).await?;
        let stamp = artifact_stamp(&self.cadence, due_at);
        let artifact = Artifact {
            collection: collection.to_string(),
            kind: BackupKind::Full,
            destination: Destination::Archive,
            dedup_key: format!("{}:full:{}", collection, stamp),
            path_stem: format!(
                "{}/{}_{}_{}.full",
                collection,
                collection,
                stamp,
                self.cadence.unit()
            ),
            created_at: now,
            watermark: None,
            payload,
        };

        let outcome = self.ctx.ship(&guard, artifact).await?;
        Ok(TickOutcome::from_append(outcome))
    }

    /// Re-exports `collection` to its fixed path on the overwrite destination
    /// once the previous export is at least the minimum age old.
    pub async fn tick_overwrite(&self, collection: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.ensure_known(collection, &self.overwrite_collections)?;
        if self.overwrite_slots.needs_schedule(collection)? {
            let first_due = self
                .ctx
                .ledger
                .latest_of(collection, BackupKind::Full, Destination::Overwrite)
                .await
                .and_then(|record| record.created_at.checked_add_signed(self.overwrite_min_age))
                .unwrap_or(now);
            self.overwrite_slots.set_next_due(collection, first_due)?;
        }

        let next_due = now
            .checked_add_signed(self.overwrite_min_age)
            .ok_or_else(|| BackupError::ConfigError("overwrite_min_age_secs overflows".to_string()))?;
        let guard = match self.overwrite_slots.try_begin(collection, now, false)? {
            Admission::NotDue(next_due) => return Ok(TickOutcome::NotDue { next_due }),
            Admission::Busy => return Ok(TickOutcome::Skipped),
            Admission::Suspended => return Ok(TickOutcome::Suspended),
            Admission::Started { guard, .. } => guard,
        };

        let result = self.export_overwrite(guard, collection, now).await;
        self.ctx
            .settle(&self.overwrite_slots, collection, "overwrite", now, result, next_due)
    }

    async fn export_overwrite(
        &self,
        guard: PhaseGuard,
        collection: &str,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let _lock = self.ctx.locks.acquire(collection).await?;
        self.ctx.ensure_running()?;

        let payload = self.ctx.source.read_consistent_snapshot(collection).await?;
        let artifact = Artifact {
            collection: collection.to_string(),
            kind: BackupKind::Full,
            destination: Destination::Overwrite,
            dedup_key: format!(
                "{}:overwrite:{}",
                collection,
                now.format("%Y_%m_%d_%H_%M_%S")
            ),
            path_stem: format!("{}/{}.full", collection, collection),
            created_at: now,
            watermark: None,
            payload,
        };

        let outcome = self.ctx.ship(&guard, artifact).await?;
        Ok(TickOutcome::from_append(outcome))
    }

    fn ensure_known(&self, collection: &str, configured: &[String]) -> Result<()> {
        if configured.iter().any(|name| name == collection) {
            Ok(())
        } else {
            Err(BackupError::NotFound(format!(
                "collection '{}' is not configured for this backup",
                collection
            )))
        }
    }
}
