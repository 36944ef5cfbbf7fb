//! Append-only JSON-lines file shared by the backup and crash ledgers.
//!
//! One serialized entry per line; every append is flushed and `fsync`ed
//! before it returns. A line cut short by a crash can only be the last one,
//! and it is dropped (and truncated away) when the journal is reopened.

use crate::core::{BackupError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{Level, event};

pub(crate) struct JournalFile {
    path: PathBuf,
    file: File,
    /// Bytes known to hold complete entries.
    committed_len: u64,
}

impl JournalFile {
    /// Opens (creating if needed) the journal at `path` and replays it.
    pub(crate) async fn open<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<(Self, Vec<T>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|err| {
                    BackupError::LedgerWriteError(format!(
                        "Failed to create ledger directory '{}': {}",
                        parent.display(),
                        err
                    ))
                })?;
            }
        }

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(BackupError::LedgerWriteError(format!(
                    "Failed to read ledger '{}': {}",
                    path.display(),
                    err
                )));
            }
        };

        let (entries, valid_len, needs_newline) = replay::<T>(&path, &bytes)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| BackupError::LedgerWriteError(format!("open ledger: {}", err)))?;

        if valid_len < bytes.len() as u64 {
            event!(
                Level::WARN,
                ledger = %path.display(),
                dropped_bytes = bytes.len() as u64 - valid_len,
                "dropping torn ledger tail"
            );
            file.set_len(valid_len)
                .await
                .map_err(|err| BackupError::LedgerWriteError(format!("truncate ledger: {}", err)))?;
        }

        let mut journal = Self {
            path,
            file,
            committed_len: valid_len,
        };

        if needs_newline {
            journal.write_durably(b"\n").await?;
        }

        Ok((journal, entries))
    }

    /// Appends one entry; durable once this returns `Ok`.
    pub(crate) async fn append<T: Serialize>(&mut self, entry: &T) -> Result<()> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|err| BackupError::LedgerWriteError(format!("serialize ledger entry: {}", err)))?;
        line.push(b'\n');
        self.write_durably(&line).await
    }

    async fn write_durably(&mut self, bytes: &[u8]) -> Result<()> {
        let write = async {
            self.file.write_all(bytes).await?;
            self.file.flush().await?;
            self.file.sync_data().await
        };

        let outcome = write.await;
        match outcome {
            Ok(()) => {
                self.committed_len += bytes.len() as u64;
                Ok(())
            }
            Err(err) => {
                // Cut a half-written line back off so the next append starts clean.
                let _ = self.file.set_len(self.committed_len).await;
                Err(BackupError::LedgerWriteError(format!(
                    "append to '{}': {}",
                    self.path.display(),
                    err
                )))
            }
        }
    }
}

/// Parses complete lines. Returns the entries, the byte length that holds
/// them, and whether the final entry is missing its newline.
fn replay<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<(Vec<T>, u64, bool)> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let (line, next, terminated) = match bytes[offset..].iter().position(|b| *b == b'\n') {
            Some(pos) => (&bytes[offset..offset + pos], offset + pos + 1, true),
            None => (&bytes[offset..], bytes.len(), false),
        };

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            offset = next;
            continue;
        }

        match serde_json::from_slice::<T>(line) {
            Ok(entry) => {
                entries.push(entry);
                if !terminated {
                    return Ok((entries, bytes.len() as u64, true));
                }
            }
            Err(_) if !terminated => {
                return Ok((entries, offset as u64, false));
            }
            Err(err) => {
                return Err(BackupError::LedgerWriteError(format!(
                    "corrupt entry in '{}' at byte {}: {}",
                    path.display(),
                    offset,
                    err
                )));
            }
        }
        offset = next;
    }

    Ok((entries, bytes.len() as u64, false))
}
