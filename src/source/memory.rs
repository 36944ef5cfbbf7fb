use super::CollectionSource;
use crate::core::{BackupError, CommittedDelta, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default, Clone)]
struct CollectionData {
    snapshot: Option<Vec<u8>>,
    deltas: Vec<CommittedDelta>,
}

/// In-process source for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    collections: RwLock<HashMap<String, CollectionData>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, collection: &str, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let mut collections = self.collections.write()?;
        collections.entry(collection.to_string()).or_default().snapshot = Some(bytes.into());
        Ok(())
    }

    /// Commits a delta and returns its sequence number.
    pub fn commit_delta(
        &self,
        collection: &str,
        committed_at: DateTime<Utc>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<u64> {
        let mut collections = self.collections.write()?;
        let data = collections.entry(collection.to_string()).or_default();
        let seq = data.deltas.last().map(|d| d.seq + 1).unwrap_or(1);
        data.deltas
            .push(CommittedDelta::new(seq, committed_at, payload));
        Ok(seq)
    }

    pub fn delta_count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read()?;
        Ok(collections
            .get(collection)
            .map(|data| data.deltas.len())
            .unwrap_or(0))
    }
}

#[async_trait]
impl CollectionSource for MemorySource {
    async fn read_consistent_snapshot(&self, collection: &str) -> Result<Vec<u8>> {
        let collections = self.collections.read()?;
        collections
            .get(collection)
            .and_then(|data| data.snapshot.clone())
            .ok_or_else(|| BackupError::SourceError {
                collection: collection.to_string(),
                message: "no snapshot available".to_string(),
            })
    }

    async fn read_deltas_since(
        &self,
        collection: &str,
        watermark: Option<u64>,
    ) -> Result<Vec<CommittedDelta>> {
        let collections = self.collections.read()?;
        let Some(data) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(data
            .deltas
            .iter()
            .filter(|delta| watermark.is_none_or(|mark| delta.seq > mark))
            .cloned()
            .collect())
    }
}
