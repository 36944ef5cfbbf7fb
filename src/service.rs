//! Wires configuration, backends, ledgers and managers into one service.

use crate::backend::{BackendHandle, BackendTarget, open_targets};
use crate::codec::Codec;
use crate::config::{CollectorConfig, ScheduleProfile};
use crate::core::{BackupKind, Result};
use crate::engine::{
    AlertReporter, CollectionLocks, EngineContext, RestoreReader, SnapshotManager, StreamManager,
};
use crate::ledger::{BackupLedger, CrashLedger};
use crate::recovery::{RecoveryReport, RecoverySupervisor};
use crate::scheduler::Scheduler;
use crate::source::CollectionSource;
use crate::version::VersionCoordinator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Level, event};
use uuid::Uuid;

const ALERT_LOG_CAPACITY: usize = 256;

pub struct BackupService {
    profile: ScheduleProfile,
    ctx: Arc<EngineContext>,
    crash_ledger: Arc<CrashLedger>,
    snapshot: Arc<SnapshotManager>,
    stream: Arc<StreamManager>,
    supervisor: RecoverySupervisor,
    scheduler: Scheduler,
    restore: RestoreReader,
}

impl BackupService {
    /// Opens the configured backends and ledgers.
    pub async fn open(
        config: &CollectorConfig,
        source: Arc<dyn CollectionSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let (archive, overwrite) = open_targets(&config.backend).await?;
        Self::with_targets(config, source, archive, overwrite, shutdown).await
    }

    /// Like [`BackupService::open`] with caller-supplied backend targets.
    pub async fn with_targets(
        config: &CollectorConfig,
        source: Arc<dyn CollectionSource>,
        archive: Arc<dyn BackendTarget>,
        overwrite: Arc<dyn BackendTarget>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        config.validate()?;
        let profile = config.active_profile();

        let codec = Arc::new(Codec::new(&config.compression)?);
        let ledger = Arc::new(BackupLedger::open(&config.ledger.backup_ledger_path).await?);
        let crash_ledger = Arc::new(CrashLedger::open(&config.ledger.crash_ledger_path).await?);

        let ctx = Arc::new(EngineContext {
            codec: Arc::clone(&codec),
            archive: BackendHandle::new(Arc::clone(&archive), config.upload.clone()),
            overwrite: BackendHandle::new(Arc::clone(&overwrite), config.upload.clone()),
            ledger: Arc::clone(&ledger),
            version: Arc::new(VersionCoordinator::new(&config.version)),
            source,
            alerts: Arc::new(AlertReporter::new(
                ALERT_LOG_CAPACITY,
                config.scheduler.alert_after_failures,
            )),
            locks: CollectionLocks::default(),
            shutdown,
        });

        let snapshot = Arc::new(SnapshotManager::new(
            Arc::clone(&ctx),
            profile.snapshot_cadence,
            config.collections_of(BackupKind::Full),
            config.overwrite_collections.clone(),
            config.overwrite_min_age_secs,
        )?);
        let stream = Arc::new(StreamManager::new(
            Arc::clone(&ctx),
            profile.stream_cadence,
            profile.safe_margin,
            config.collections_of(BackupKind::Incremental),
        )?);

        let supervisor = RecoverySupervisor::new(
            Arc::clone(&crash_ledger),
            ledger,
            Arc::clone(&snapshot),
            Arc::clone(&stream),
        );
        let scheduler = Scheduler::new(Arc::clone(&snapshot), Arc::clone(&stream), &config.scheduler);
        let restore = RestoreReader::new(codec, archive, overwrite);

        event!(
            Level::INFO,
            environment = %profile.mode,
            snapshot_cadence = %profile.snapshot_cadence,
            stream_cadence = %profile.stream_cadence,
            safe_margin_secs = profile.safe_margin.as_secs(),
            backend = %ctx.archive.kind(),
            "backup service configured"
        );

        Ok(Self {
            profile,
            ctx,
            crash_ledger,
            snapshot,
            stream,
            supervisor,
            scheduler,
            restore,
        })
    }

    /// Recovery, then scheduling until shutdown, then the clean-exit marker.
    ///
    /// A process-fatal error leaves the run marker in place, so the next
    /// start treats this run as a crash.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let run_id = Uuid::new_v4().to_string();
        let report = self.start(&run_id, Utc::now()).await?;
        self.scheduler.run(self.ctx.shutdown.clone()).await?;
        self.finish(&run_id, Utc::now()).await?;
        Ok(report)
    }

    /// Startup hook: writes the run marker and performs crash recovery.
    pub async fn start(&self, run_id: &str, now: DateTime<Utc>) -> Result<RecoveryReport> {
        self.supervisor.start(run_id, now).await
    }

    /// Clears the run marker after a clean stop.
    pub async fn finish(&self, run_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.crash_ledger.mark_run_ended(run_id, now).await?;
        event!(Level::INFO, run_id, "backup service stopped cleanly");
        Ok(())
    }

    /// Lifts a fatal-backend suspension of `collection` in every manager.
    pub fn resume(&self, collection: &str) -> Result<bool> {
        let snapshot = self.snapshot.resume(collection)?;
        let stream = self.stream.resume(collection)?;
        if snapshot || stream {
            event!(Level::INFO, collection, "backups resumed by operator");
        }
        Ok(snapshot || stream)
    }

    pub fn profile(&self) -> &ScheduleProfile {
        &self.profile
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn ledger(&self) -> &Arc<BackupLedger> {
        &self.ctx.ledger
    }

    pub fn crash_ledger(&self) -> &Arc<CrashLedger> {
        &self.crash_ledger
    }

    pub fn version(&self) -> &Arc<VersionCoordinator> {
        &self.ctx.version
    }

    pub fn alerts(&self) -> &Arc<AlertReporter> {
        &self.ctx.alerts
    }

    pub fn snapshot(&self) -> &Arc<SnapshotManager> {
        &self.snapshot
    }

    pub fn stream(&self) -> &Arc<StreamManager> {
        &self.stream
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn restore(&self) -> &RestoreReader {
        &self.restore
    }
}
