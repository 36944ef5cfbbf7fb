//! The timer loop that drives the managers.

use crate::core::{BackupError, Result};
use crate::engine::{SnapshotManager, StreamManager, TickOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{Level, event};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How often due times are checked.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Consecutive failures of one collection before its alert escalates.
    #[serde(default = "default_alert_after_failures")]
    pub alert_after_failures: u32,
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_alert_after_failures() -> u32 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            alert_after_failures: default_alert_after_failures(),
        }
    }
}

/// Which manager operation a unit of work ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Snapshot,
    Overwrite,
    Stream,
}

type WorkResult = (String, WorkKind, Result<TickOutcome>);

pub struct Scheduler {
    snapshot: Arc<SnapshotManager>,
    stream: Arc<StreamManager>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        snapshot: Arc<SnapshotManager>,
        stream: Arc<StreamManager>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            snapshot,
            stream,
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
        }
    }

    /// Spawns one unit of work per configured collection and operation.
    /// Each unit decides for itself whether it is due.
    fn spawn_ticks(&self, set: &mut JoinSet<WorkResult>, now: DateTime<Utc>) {
        for collection in self.snapshot.collections() {
            let manager = Arc::clone(&self.snapshot);
            let collection = collection.clone();
            set.spawn(async move {
                let outcome = manager.tick(&collection, now).await;
                (collection, WorkKind::Snapshot, outcome)
            });
        }
        for collection in self.snapshot.overwrite_collections() {
            let manager = Arc::clone(&self.snapshot);
            let collection = collection.clone();
            set.spawn(async move {
                let outcome = manager.tick_overwrite(&collection, now).await;
                (collection, WorkKind::Overwrite, outcome)
            });
        }
        for collection in self.stream.collections() {
            let manager = Arc::clone(&self.stream);
            let collection = collection.clone();
            set.spawn(async move {
                let outcome = manager.tick(&collection, now).await;
                (collection, WorkKind::Stream, outcome)
            });
        }
    }

    /// Runs every due unit of work for `now` and waits for all of them.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Vec<(String, WorkKind, TickOutcome)>> {
        let mut set = JoinSet::new();
        self.spawn_ticks(&mut set, now);

        let mut outcomes = Vec::new();
        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match Self::inspect(joined) {
                Ok(Some(done)) => outcomes.push(done),
                Ok(None) => {}
                Err(err) => {
                    fatal.get_or_insert(err);
                }
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Ticks until `shutdown` flips to `true` or a process-fatal error
    /// surfaces. In-flight work is always drained before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: JoinSet<WorkResult> = JoinSet::new();
        let mut fatal: Option<BackupError> = None;

        event!(
            Level::INFO,
            tick_ms = self.tick_interval.as_millis() as u64,
            "scheduler started"
        );

        while fatal.is_none() && !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.spawn_ticks(&mut in_flight, Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone; nobody can ask for a clean stop any more.
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = Self::inspect(joined) {
                        fatal = Some(err);
                    }
                }
            }
        }

        event!(
            Level::INFO,
            in_flight = in_flight.len(),
            "scheduler stopping, draining in-flight work"
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = Self::inspect(joined) {
                fatal.get_or_insert(err);
            }
        }

        match fatal {
            Some(err) => {
                event!(Level::ERROR, error = %err, "scheduler halted");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Separates process-fatal errors from contained outcomes.
    fn inspect(
        joined: std::result::Result<WorkResult, tokio::task::JoinError>,
    ) -> Result<Option<(String, WorkKind, TickOutcome)>> {
        match joined {
            Ok((collection, kind, Ok(outcome))) => {
                if let TickOutcome::Completed(record) = &outcome {
                    event!(
                        Level::DEBUG,
                        collection = %collection,
                        record_id = record.record_id,
                        "scheduled backup completed"
                    );
                }
                Ok(Some((collection, kind, outcome)))
            }
            Ok((collection, kind, Err(err))) if err.is_process_fatal() => {
                event!(Level::ERROR, collection = %collection, ?kind, error = %err, "process-fatal backup error");
                Err(err)
            }
            Ok((collection, kind, Err(err))) => {
                event!(Level::WARN, collection = %collection, ?kind, error = %err, "backup tick rejected");
                Ok(None)
            }
            Err(join_err) => {
                event!(Level::ERROR, error = %join_err, "backup task panicked");
                Ok(None)
            }
        }
    }
}
