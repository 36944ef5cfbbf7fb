use super::journal::JournalFile;
use crate::core::{BackupKind, BackupRecord, Destination, NewBackupRecord, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Result of an append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    /// The stored record: the new one, or the one already holding the key.
    pub record: BackupRecord,
    /// `false` when the deduplication key was already present.
    pub inserted: bool,
}

struct BackupLedgerState {
    journal: JournalFile,
    records: Vec<BackupRecord>,
    by_key: HashMap<String, usize>,
    by_collection: HashMap<String, Vec<usize>>,
    next_id: u64,
}

/// Durable, append-only record of completed backups.
///
/// Appends go through one async lock, so records of a collection are stored
/// in the order they were appended and `created_at` never goes backwards
/// within a collection.
pub struct BackupLedger {
    path: PathBuf,
    state: Mutex<BackupLedgerState>,
}

impl BackupLedger {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (journal, stored) = JournalFile::open::<BackupRecord>(&path).await?;

        let mut state = BackupLedgerState {
            journal,
            records: Vec::with_capacity(stored.len()),
            by_key: HashMap::new(),
            by_collection: HashMap::new(),
            next_id: 1,
        };
        for record in stored {
            state.index(record);
        }

        event!(
            Level::DEBUG,
            ledger = %path.display(),
            records = state.records.len(),
            "backup ledger opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably appends `record` unless its deduplication key is already stored.
    ///
    /// A `created_at` earlier than the collection's latest record is raised
    /// to that record's timestamp.
    pub async fn append(&self, record: NewBackupRecord) -> Result<AppendOutcome> {
        let mut state = self.state.lock().await;

        if let Some(&existing) = state.by_key.get(&record.dedup_key) {
            return Ok(AppendOutcome {
                record: state.records[existing].clone(),
                inserted: false,
            });
        }

        let mut record = record;
        if let Some(latest) = state.latest_index(&record.collection_name) {
            let floor = state.records[latest].created_at;
            if record.created_at < floor {
                record.created_at = floor;
            }
        }

        let stored = BackupRecord::from_new(state.next_id, record);
        state.journal.append(&stored).await?;
        state.index(stored.clone());

        Ok(AppendOutcome {
            record: stored,
            inserted: true,
        })
    }

    /// Records of `collection` ordered by `created_at`.
    pub async fn list(&self, collection: &str) -> Vec<BackupRecord> {
        let state = self.state.lock().await;
        state
            .by_collection
            .get(collection)
            .map(|indexes| indexes.iter().map(|i| state.records[*i].clone()).collect())
            .unwrap_or_default()
    }

    pub async fn latest(&self, collection: &str) -> Option<BackupRecord> {
        let state = self.state.lock().await;
        state
            .latest_index(collection)
            .map(|i| state.records[i].clone())
    }

    /// Latest record of `collection` with the given kind and destination.
    pub async fn latest_of(
        &self,
        collection: &str,
        kind: BackupKind,
        destination: Destination,
    ) -> Option<BackupRecord> {
        let state = self.state.lock().await;
        state.by_collection.get(collection).and_then(|indexes| {
            indexes
                .iter()
                .rev()
                .map(|i| &state.records[*i])
                .find(|r| r.kind == kind && r.destination == destination)
                .cloned()
        })
    }

    pub async fn get(&self, record_id: u64) -> Option<BackupRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .find(|record| record.record_id == record_id)
            .cloned()
    }

    pub async fn find_key(&self, dedup_key: &str) -> Option<BackupRecord> {
        let state = self.state.lock().await;
        state
            .by_key
            .get(dedup_key)
            .map(|i| state.records[*i].clone())
    }

    /// Highest record id stored so far, `0` when empty.
    pub async fn last_record_id(&self) -> u64 {
        self.state.lock().await.next_id.saturating_sub(1)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn collections(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.by_collection.keys().cloned().collect();
        names.sort();
        names
    }
}

impl BackupLedgerState {
    fn index(&mut self, record: BackupRecord) {
        let position = self.records.len();
        self.next_id = self.next_id.max(record.record_id.saturating_add(1));
        self.by_key.insert(record.dedup_key.clone(), position);
        self.by_collection
            .entry(record.collection_name.clone())
            .or_default()
            .push(position);
        self.records.push(record);
    }

    fn latest_index(&self, collection: &str) -> Option<usize> {
        self.by_collection
            .get(collection)
            .and_then(|indexes| indexes.last().copied())
    }
}
