use super::pipeline::Artifact;
use super::slots::{Admission, PhaseGuard, SlotStatus, SlotTable};
use super::{EngineContext, TickOutcome, artifact_stamp};
use crate::core::{BackupError, BackupKind, CommittedDelta, Destination, Result};
use crate::schedule::{ScheduleSpec, resolve};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Level, event};

/// Incremental flushes of committed deltas for append-style collections.
///
/// Only deltas committed strictly before `now - safe_margin` are flushed.
/// The per-collection watermark (highest flushed `seq`) moves only after the
/// ledger append succeeds, and is rebuilt from the ledger on restart.
pub struct StreamManager {
    ctx: Arc<EngineContext>,
    cadence: ScheduleSpec,
    safe_margin: TimeDelta,
    collections: Vec<String>,
    slots: Arc<SlotTable>,
    watermarks: Mutex<HashMap<String, Option<u64>>>,
}

impl StreamManager {
    pub fn new(
        ctx: Arc<EngineContext>,
        cadence: ScheduleSpec,
        safe_margin: Duration,
        collections: Vec<String>,
    ) -> Result<Self> {
        if safe_margin >= cadence.period() {
            return Err(BackupError::ConfigError(format!(
                "safe margin of {}s must be shorter than the stream cadence {}",
                safe_margin.as_secs(),
                cadence
            )));
        }
        let safe_margin = TimeDelta::from_std(safe_margin)
            .map_err(|err| BackupError::ConfigError(format!("safe margin: {}", err)))?;

        Ok(Self {
            ctx,
            cadence,
            safe_margin,
            collections,
            slots: SlotTable::new(),
            watermarks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cadence(&self) -> &ScheduleSpec {
        &self.cadence
    }

    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub fn status(&self, collection: &str) -> Result<SlotStatus> {
        self.slots.status(collection)
    }

    pub fn resume(&self, collection: &str) -> Result<bool> {
        self.slots.resume(collection)
    }

    /// Highest delta `seq` already covered by a recorded flush.
    pub async fn watermark(&self, collection: &str) -> Result<Option<u64>> {
        let cached = self.watermarks.lock()?.get(collection).copied();
        if let Some(mark) = cached {
            return Ok(mark);
        }
        let recorded = self
            .ctx
            .ledger
            .latest_of(collection, BackupKind::Incremental, Destination::Archive)
            .await
            .and_then(|record| record.watermark);

        let mut watermarks = self.watermarks.lock()?;
        let mark = watermarks.entry(collection.to_string()).or_insert(recorded);
        Ok(*mark)
    }

    fn advance_watermark(&self, collection: &str, seq: u64) -> Result<()> {
        let mut watermarks = self.watermarks.lock()?;
        let mark = watermarks.entry(collection.to_string()).or_insert(None);
        if mark.is_none_or(|current| current < seq) {
            *mark = Some(seq);
        }
        Ok(())
    }

    pub async fn tick(&self, collection: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.ensure_known(collection)?;
        if self.slots.needs_schedule(collection)? {
            let first_due = match self
                .ctx
                .ledger
                .latest_of(collection, BackupKind::Incremental, Destination::Archive)
                .await
            {
                Some(record) => resolve(&self.cadence, record.created_at)?,
                None => now,
            };
            self.slots.set_next_due(collection, first_due)?;
        }
        self.run(collection, now, false).await
    }

    /// Out-of-band flush that ignores the due time.
    pub async fn flush_now(&self, collection: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.ensure_known(collection)?;
        self.run(collection, now, true).await
    }

    async fn run(&self, collection: &str, now: DateTime<Utc>, force: bool) -> Result<TickOutcome> {
        let next_due = resolve(&self.cadence, now)?;
        let guard = match self.slots.try_begin(collection, now, force)? {
            Admission::NotDue(next_due) => return Ok(TickOutcome::NotDue { next_due }),
            Admission::Busy => {
                event!(Level::DEBUG, collection, "stream flush already in flight, tick dropped");
                return Ok(TickOutcome::Skipped);
            }
            Admission::Suspended => return Ok(TickOutcome::Suspended),
            Admission::Started { guard, .. } => guard,
        };

        let result = self.flush(guard, collection, now).await;
        self.ctx
            .settle(&self.slots, collection, "stream", now, result, next_due)
    }

    async fn flush(&self, guard: PhaseGuard, collection: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        let _lock = self.ctx.locks.acquire(collection).await?;
        self.ctx.ensure_running()?;

        let watermark = self.watermark(collection).await?;
        let cutoff = now - self.safe_margin;

        let mut deltas = self
            .ctx
            .source
            .read_deltas_since(collection, watermark)
            .await?;
        deltas.retain(|delta| watermark.is_none_or(|mark| delta.seq > mark));
        deltas.sort_by_key(|delta| delta.seq);

        // The watermark is a seq boundary, so stop at the first delta that is
        // still inside the margin even if later ones are older.
        let eligible: Vec<CommittedDelta> = deltas
            .into_iter()
            .take_while(|delta| delta.committed_at < cutoff)
            .collect();

        let (Some(first), Some(last)) = (
            eligible.first().map(|delta| delta.seq),
            eligible.last().map(|delta| delta.seq),
        ) else {
            event!(Level::DEBUG, collection, "no deltas past the safe margin");
            return Ok(TickOutcome::NothingToFlush);
        };

        let payload = rmp_serde::to_vec(&eligible)
            .map_err(|err| BackupError::CodecError(format!("encode delta batch: {}", err)))?;
        let stamp = artifact_stamp(&self.cadence, now);
        let artifact = Artifact {
            collection: collection.to_string(),
            kind: BackupKind::Incremental,
            destination: Destination::Archive,
            dedup_key: format!("{}:incremental:{}-{}", collection, first, last),
            path_stem: format!(
                "{}/{}_{}_{}_{}-{}.incremental",
                collection,
                collection,
                stamp,
                self.cadence.unit(),
                first,
                last
            ),
            created_at: now,
            watermark: Some(last),
            payload,
        };

        let outcome = self.ctx.ship(&guard, artifact).await?;
        self.advance_watermark(collection, outcome.record.watermark.unwrap_or(last))?;
        Ok(TickOutcome::from_append(outcome))
    }

    fn ensure_known(&self, collection: &str) -> Result<()> {
        if self.collections.iter().any(|name| name == collection) {
            Ok(())
        } else {
            Err(BackupError::NotFound(format!(
                "collection '{}' is not configured for stream backup",
                collection
            )))
        }
    }
}
