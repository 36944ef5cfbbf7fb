use crate::codec::CompressionAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a backup artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Full point-in-time copy of a collection.
    Full,
    /// Committed deltas appended since the previous watermark.
    #[serde(alias = "orderbook")]
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which configured destination an artifact was shipped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// Time-stamped archive artifacts, never replaced.
    #[default]
    Archive,
    /// One artifact per collection, replaced on every run.
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Cloud => f.write_str("cloud"),
        }
    }
}

/// Where a backend stored an artifact.
///
/// `key` is the path relative to the backend root; `uri` is the fully
/// qualified form kept for operators reading the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub backend: BackendKind,
    pub key: String,
    pub uri: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// A backup about to be appended to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBackupRecord {
    /// Appending the same key twice stores one record.
    pub dedup_key: String,
    pub collection_name: String,
    pub kind: BackupKind,
    #[serde(default)]
    pub destination: Destination,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub compression_algorithm: CompressionAlgorithm,
    pub backend_location: Location,
    pub byte_size: u64,
    pub checksum: String,
    /// Highest delta sequence covered, incremental records only.
    #[serde(default)]
    pub watermark: Option<u64>,
}

/// Immutable ledger entry describing one completed backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub record_id: u64,
    pub dedup_key: String,
    pub collection_name: String,
    pub kind: BackupKind,
    #[serde(default)]
    pub destination: Destination,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub compression_algorithm: CompressionAlgorithm,
    pub backend_location: Location,
    pub byte_size: u64,
    pub checksum: String,
    #[serde(default)]
    pub watermark: Option<u64>,
}

impl BackupRecord {
    pub(crate) fn from_new(record_id: u64, record: NewBackupRecord) -> Self {
        let NewBackupRecord {
            dedup_key,
            collection_name,
            kind,
            destination,
            schema_version,
            created_at,
            compression_algorithm,
            backend_location,
            byte_size,
            checksum,
            watermark,
        } = record;

        Self {
            record_id,
            dedup_key,
            collection_name,
            kind,
            destination,
            schema_version,
            created_at,
            compression_algorithm,
            backend_location,
            byte_size,
            checksum,
            watermark,
        }
    }
}

/// An abnormal termination and its recovery outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub crash_id: u64,
    pub detected_at: DateTime<Utc>,
    /// Highest Backup Ledger record id known when the crashed run started.
    pub last_known_good_record_id: u64,
    /// Run whose marker was never cleared.
    pub crashed_run_id: String,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl CrashRecord {
    pub fn is_open(&self) -> bool {
        self.recovered_at.is_none()
    }
}

/// One committed record from an append-style collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedDelta {
    /// Strictly increasing per collection.
    pub seq: u64,
    pub committed_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl CommittedDelta {
    pub fn new(seq: u64, committed_at: DateTime<Utc>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            committed_at,
            payload: payload.into(),
        }
    }
}
