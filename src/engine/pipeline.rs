use super::EngineContext;
use super::slots::{Phase, PhaseGuard};
use crate::codec::checksum;
use crate::core::{BackupError, BackupKind, Destination, NewBackupRecord, Result};
use crate::ledger::AppendOutcome;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{Level, event};

/// A captured payload on its way to a backend and the ledger.
pub(crate) struct Artifact {
    pub(crate) collection: String,
    pub(crate) kind: BackupKind,
    pub(crate) destination: Destination,
    pub(crate) dedup_key: String,
    /// Backend-relative path without the compression extension.
    pub(crate) path_stem: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) watermark: Option<u64>,
    pub(crate) payload: Vec<u8>,
}

impl EngineContext {
    /// Compresses, uploads and records `artifact`.
    ///
    /// Shutdown is honoured up to the start of the upload. Once bytes are on
    /// the backend the ledger append always runs, so a stored artifact is
    /// never left without its record by a clean stop.
    pub(crate) async fn ship(&self, guard: &PhaseGuard, artifact: Artifact) -> Result<AppendOutcome> {
        if let Some(existing) = self.ledger.find_key(&artifact.dedup_key).await {
            return Ok(AppendOutcome {
                record: existing,
                inserted: false,
            });
        }

        let version = self.version.stamp()?;

        guard.advance(Phase::Compressing);
        let algorithm = self.codec.default_algorithm();
        let codec = Arc::clone(&self.codec);
        let payload = artifact.payload;
        let compressed = tokio::task::spawn_blocking(move || codec.compress(&payload, algorithm))
            .await
            .map_err(|err| BackupError::CodecError(format!("compression task failed: {}", err)))??;
        let digest = checksum(&compressed);
        let byte_size = compressed.len() as u64;

        self.ensure_running()?;

        guard.advance(Phase::Uploading);
        let backend = match artifact.destination {
            Destination::Archive => &self.archive,
            Destination::Overwrite => &self.overwrite,
        };
        let path = format!("{}.{}", artifact.path_stem, algorithm.extension());
        let location = backend.upload(&path, compressed).await?;

        guard.advance(Phase::Recording);
        let outcome = self
            .ledger
            .append(NewBackupRecord {
                dedup_key: artifact.dedup_key,
                collection_name: artifact.collection,
                kind: artifact.kind,
                destination: artifact.destination,
                schema_version: version,
                created_at: artifact.created_at,
                compression_algorithm: algorithm,
                backend_location: location,
                byte_size,
                checksum: digest,
                watermark: artifact.watermark,
            })
            .await?;
        self.version.record_success(version)?;

        event!(
            Level::INFO,
            collection = %outcome.record.collection_name,
            kind = %outcome.record.kind,
            record_id = outcome.record.record_id,
            bytes = byte_size,
            location = %outcome.record.backend_location,
            "backup recorded"
        );
        Ok(outcome)
    }
}
