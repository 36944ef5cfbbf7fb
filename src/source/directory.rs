use super::CollectionSource;
use crate::core::{BackupError, CommittedDelta, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{Level, event};

/// Reads collections exported by the collector into a directory:
///
/// * `<collection>.json` holds the latest consistent snapshot, replaced
///   atomically by the writer;
/// * `<collection>.deltas.jsonl` holds committed deltas, one JSON object per
///   line: `{"seq": 1, "committed_at": "...", "record": {...}}`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

#[derive(Deserialize)]
struct DeltaLine {
    seq: u64,
    committed_at: DateTime<Utc>,
    record: serde_json::Value,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source_error(collection: &str, message: impl Into<String>) -> BackupError {
        BackupError::SourceError {
            collection: collection.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl CollectionSource for DirectorySource {
    async fn read_consistent_snapshot(&self, collection: &str) -> Result<Vec<u8>> {
        let path = self.root.join(format!("{}.json", collection));
        fs::read(&path)
            .await
            .map_err(|err| Self::source_error(collection, format!("{}: {}", path.display(), err)))
    }

    async fn read_deltas_since(
        &self,
        collection: &str,
        watermark: Option<u64>,
    ) -> Result<Vec<CommittedDelta>> {
        let path = self.root.join(format!("{}.deltas.jsonl", collection));
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(Self::source_error(
                    collection,
                    format!("{}: {}", path.display(), err),
                ));
            }
        };

        let terminated = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();
        let mut deltas = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: DeltaLine = match serde_json::from_str(line) {
                Ok(parsed) => parsed,
                // The writer may be mid-append on the last line.
                Err(_) if index + 1 == lines.len() && !terminated => {
                    event!(Level::DEBUG, collection, "skipping unterminated delta line");
                    break;
                }
                Err(err) => {
                    return Err(Self::source_error(
                        collection,
                        format!("line {}: {}", index + 1, err),
                    ));
                }
            };
            if watermark.is_some_and(|mark| parsed.seq <= mark) {
                continue;
            }
            let payload = serde_json::to_vec(&parsed.record)
                .map_err(|err| Self::source_error(collection, err.to_string()))?;
            deltas.push(CommittedDelta::new(parsed.seq, parsed.committed_at, payload));
        }

        deltas.sort_by_key(|delta| delta.seq);
        Ok(deltas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_snapshot_and_deltas_past_watermark() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("trades.json"), br#"[{"px":1}]"#).unwrap();
        std::fs::write(
            dir.path().join("orderbook.deltas.jsonl"),
            concat!(
                "{\"seq\":1,\"committed_at\":\"2024-01-01T00:00:01Z\",\"record\":{\"bid\":1}}\n",
                "{\"seq\":2,\"committed_at\":\"2024-01-01T00:00:02Z\",\"record\":{\"bid\":2}}\n",
                "{\"seq\":3,\"committed_at\":\"2024-01-01T00:00:03Z\",\"rec",
            ),
        )
        .unwrap();

        let source = DirectorySource::new(dir.path());
        assert_eq!(
            source.read_consistent_snapshot("trades").await.unwrap(),
            br#"[{"px":1}]"#.to_vec()
        );

        let deltas = source.read_deltas_since("orderbook", Some(1)).await.unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].seq, 2);
        assert_eq!(deltas[0].payload, br#"{"bid":2}"#.to_vec());
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_source_error() {
        let dir = TempDir::new().unwrap();
        let source = DirectorySource::new(dir.path());
        let err = source.read_consistent_snapshot("absent").await.unwrap_err();
        assert!(matches!(err, BackupError::SourceError { .. }));
        assert!(source.read_deltas_since("absent", None).await.unwrap().is_empty());
    }
}
