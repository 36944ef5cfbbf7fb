use crate::backend::BackendTarget;
use crate::codec::{Codec, checksum};
use crate::core::{BackupError, BackupKind, BackupRecord, CommittedDelta, Destination, Result};
use std::sync::Arc;

/// Contents of a recorded artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoredArtifact {
    Snapshot(Vec<u8>),
    Deltas(Vec<CommittedDelta>),
}

/// Reads recorded artifacts back and verifies them against the ledger.
pub struct RestoreReader {
    codec: Arc<Codec>,
    archive: Arc<dyn BackendTarget>,
    overwrite: Arc<dyn BackendTarget>,
}

impl RestoreReader {
    pub fn new(
        codec: Arc<Codec>,
        archive: Arc<dyn BackendTarget>,
        overwrite: Arc<dyn BackendTarget>,
    ) -> Self {
        Self {
            codec,
            archive,
            overwrite,
        }
    }

    /// Fetches the artifact of `record`, checks its checksum and returns the
    /// decompressed payload.
    pub async fn fetch(&self, record: &BackupRecord) -> Result<Vec<u8>> {
        let target = match record.destination {
            Destination::Archive => &self.archive,
            Destination::Overwrite => &self.overwrite,
        };
        let bytes = target.get(&record.backend_location).await?;

        let actual = checksum(&bytes);
        if actual != record.checksum {
            return Err(BackupError::CodecError(format!(
                "checksum mismatch for record {} at {}: expected {}, found {}",
                record.record_id, record.backend_location, record.checksum, actual
            )));
        }

        let codec = Arc::clone(&self.codec);
        let algorithm = record.compression_algorithm;
        tokio::task::spawn_blocking(move || codec.decompress(&bytes, algorithm))
            .await
            .map_err(|err| BackupError::CodecError(format!("decompression task failed: {}", err)))?
    }

    pub async fn restore(&self, record: &BackupRecord) -> Result<RestoredArtifact> {
        let payload = self.fetch(record).await?;
        match record.kind {
            BackupKind::Full => Ok(RestoredArtifact::Snapshot(payload)),
            BackupKind::Incremental => rmp_serde::from_slice(&payload)
                .map(RestoredArtifact::Deltas)
                .map_err(|err| BackupError::CodecError(format!("decode delta batch: {}", err))),
        }
    }
}
