//! Durable ledgers. The Backup Ledger and Crash Ledger are the only writers
//! of their files; everything else appends through them.

mod backup;
mod crash;
mod journal;

pub use backup::{AppendOutcome, BackupLedger};
pub use crash::{CrashLedger, RunMarker};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    #[serde(default = "default_backup_ledger_path")]
    pub backup_ledger_path: PathBuf,
    #[serde(default = "default_crash_ledger_path")]
    pub crash_ledger_path: PathBuf,
}

fn default_backup_ledger_path() -> PathBuf {
    PathBuf::from("state/backup_ledger.jsonl")
}

fn default_crash_ledger_path() -> PathBuf {
    PathBuf::from("state/crash_ledger.jsonl")
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backup_ledger_path: default_backup_ledger_path(),
            crash_ledger_path: default_crash_ledger_path(),
        }
    }
}
