use super::journal::JournalFile;
use crate::core::{BackupError, CrashRecord, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Entries of the crash journal. Each one is a single durable line, so
/// setting or clearing the run marker is one atomic step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum CrashEvent {
    RunStarted {
        run_id: String,
        started_at: DateTime<Utc>,
        last_known_good_record_id: u64,
    },
    RunEnded {
        run_id: String,
        ended_at: DateTime<Utc>,
    },
    CrashDetected {
        crash_id: u64,
        crashed_run_id: String,
        detected_at: DateTime<Utc>,
        last_known_good_record_id: u64,
    },
    CrashRecovered {
        crash_id: u64,
        recovered_at: DateTime<Utc>,
    },
    /// An unclean run found while `crash_id` was still open; it is covered by
    /// that crash's recovery.
    RunAttributed {
        run_id: String,
        crash_id: u64,
    },
}

/// A process run whose start marker was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMarker {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub last_known_good_record_id: u64,
    pub ended_at: Option<DateTime<Utc>>,
    /// Crash this run's abnormal end was recorded under.
    pub crash_id: Option<u64>,
}

#[derive(Default)]
struct CrashView {
    runs: Vec<RunMarker>,
    crashes: Vec<CrashRecord>,
}

impl CrashView {
    fn apply(&mut self, event: CrashEvent) {
        match event {
            CrashEvent::RunStarted {
                run_id,
                started_at,
                last_known_good_record_id,
            } => self.runs.push(RunMarker {
                run_id,
                started_at,
                last_known_good_record_id,
                ended_at: None,
                crash_id: None,
            }),
            CrashEvent::RunEnded { run_id, ended_at } => {
                if let Some(run) = self.runs.iter_mut().rev().find(|r| r.run_id == run_id) {
                    run.ended_at = Some(ended_at);
                }
            }
            CrashEvent::CrashDetected {
                crash_id,
                crashed_run_id,
                detected_at,
                last_known_good_record_id,
            } => {
                self.attribute(&crashed_run_id, crash_id);
                self.crashes.push(CrashRecord {
                    crash_id,
                    detected_at,
                    last_known_good_record_id,
                    crashed_run_id,
                    recovered_at: None,
                });
            }
            CrashEvent::CrashRecovered {
                crash_id,
                recovered_at,
            } => {
                if let Some(crash) = self.crashes.iter_mut().find(|c| c.crash_id == crash_id) {
                    crash.recovered_at = Some(recovered_at);
                }
            }
            CrashEvent::RunAttributed { run_id, crash_id } => self.attribute(&run_id, crash_id),
        }
    }

    fn attribute(&mut self, run_id: &str, crash_id: u64) {
        if let Some(run) = self.runs.iter_mut().rev().find(|r| r.run_id == run_id) {
            run.crash_id = Some(crash_id);
        }
    }

    fn open_crash(&self) -> Option<&CrashRecord> {
        self.crashes.iter().rev().find(|c| c.is_open())
    }
}

struct CrashLedgerState {
    journal: JournalFile,
    view: CrashView,
}

/// Durable record of run markers and abnormal terminations.
///
/// At most one crash is open at a time; detecting another while one is open
/// returns the open record, since the process is still recovering from it.
pub struct CrashLedger {
    path: PathBuf,
    state: Mutex<CrashLedgerState>,
}

impl CrashLedger {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (journal, events) = JournalFile::open::<CrashEvent>(&path).await?;
        let mut view = CrashView::default();
        for event in events {
            view.apply(event);
        }
        Ok(Self {
            path,
            state: Mutex::new(CrashLedgerState { journal, view }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn record(state: &mut CrashLedgerState, event: CrashEvent) -> Result<()> {
        state.journal.append(&event).await?;
        state.view.apply(event);
        Ok(())
    }

    /// Most recent run that started but never recorded a clean end and has
    /// not been attributed a crash yet, excluding `current_run_id`.
    pub async fn unclean_run(&self, current_run_id: Option<&str>) -> Option<RunMarker> {
        let state = self.state.lock().await;
        state
            .view
            .runs
            .iter()
            .rev()
            .filter(|run| Some(run.run_id.as_str()) != current_run_id)
            .find(|run| run.ended_at.is_none() && run.crash_id.is_none())
            .cloned()
    }

    /// Writes the "started, not yet confirmed clean" marker for this run.
    pub async fn mark_run_started(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        last_known_good_record_id: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::record(
            &mut state,
            CrashEvent::RunStarted {
                run_id: run_id.to_string(),
                started_at,
                last_known_good_record_id,
            },
        )
        .await
    }

    /// Clears the marker of `run_id`; the run ended cleanly.
    pub async fn mark_run_ended(&self, run_id: &str, ended_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.view.runs.iter().any(|r| r.run_id == run_id) {
            return Err(BackupError::NotFound(format!("run marker '{}'", run_id)));
        }
        Self::record(
            &mut state,
            CrashEvent::RunEnded {
                run_id: run_id.to_string(),
                ended_at,
            },
        )
        .await
    }

    /// Opens a crash record for `crashed_run`. While another crash is open
    /// the run is attributed to it and the open record is returned instead.
    ///
    /// Every other unclean, unattributed run except `current_run_id` is
    /// attributed to the returned crash as well, so a run that died before it
    /// could record its predecessor's crash is not detected again later.
    pub async fn record_crash(
        &self,
        crashed_run: &RunMarker,
        current_run_id: Option<&str>,
        detected_at: DateTime<Utc>,
    ) -> Result<CrashRecord> {
        let mut state = self.state.lock().await;
        let crash = Self::crash_for(&mut state, crashed_run, detected_at).await?;

        let stragglers: Vec<String> = state
            .view
            .runs
            .iter()
            .filter(|run| run.ended_at.is_none() && run.crash_id.is_none())
            .filter(|run| Some(run.run_id.as_str()) != current_run_id)
            .map(|run| run.run_id.clone())
            .collect();
        for run_id in stragglers {
            Self::record(
                &mut state,
                CrashEvent::RunAttributed {
                    run_id,
                    crash_id: crash.crash_id,
                },
            )
            .await?;
        }
        Ok(crash)
    }

    async fn crash_for(
        state: &mut CrashLedgerState,
        crashed_run: &RunMarker,
        detected_at: DateTime<Utc>,
    ) -> Result<CrashRecord> {
        if let Some(known) = state
            .view
            .crashes
            .iter()
            .find(|c| c.crashed_run_id == crashed_run.run_id)
        {
            return Ok(known.clone());
        }
        if let Some(open) = state.view.open_crash().cloned() {
            Self::record(
                state,
                CrashEvent::RunAttributed {
                    run_id: crashed_run.run_id.clone(),
                    crash_id: open.crash_id,
                },
            )
            .await?;
            return Ok(open);
        }

        let crash_id = state
            .view
            .crashes
            .iter()
            .map(|c| c.crash_id)
            .max()
            .unwrap_or(0)
            + 1;
        Self::record(
            state,
            CrashEvent::CrashDetected {
                crash_id,
                crashed_run_id: crashed_run.run_id.clone(),
                detected_at,
                last_known_good_record_id: crashed_run.last_known_good_record_id,
            },
        )
        .await?;

        state
            .view
            .open_crash()
            .cloned()
            .ok_or_else(|| BackupError::NotFound(format!("crash {}", crash_id)))
    }

    pub async fn open_crash(&self) -> Option<CrashRecord> {
        self.state.lock().await.view.open_crash().cloned()
    }

    pub async fn mark_recovered(&self, crash_id: u64, recovered_at: DateTime<Utc>) -> Result<CrashRecord> {
        let mut state = self.state.lock().await;
        match state.view.crashes.iter().find(|c| c.crash_id == crash_id) {
            None => return Err(BackupError::NotFound(format!("crash {}", crash_id))),
            Some(crash) if !crash.is_open() => return Ok(crash.clone()),
            Some(_) => {}
        }
        Self::record(
            &mut state,
            CrashEvent::CrashRecovered {
                crash_id,
                recovered_at,
            },
        )
        .await?;
        state
            .view
            .crashes
            .iter()
            .find(|c| c.crash_id == crash_id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(format!("crash {}", crash_id)))
    }

    pub async fn crashes(&self) -> Vec<CrashRecord> {
        self.state.lock().await.view.crashes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_clean_run_leaves_no_unclean_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crash.jsonl");
        {
            let ledger = CrashLedger::open(&path).await.unwrap();
            ledger.mark_run_started("run-a", t(0), 4).await.unwrap();
            ledger.mark_run_ended("run-a", t(10)).await.unwrap();
        }
        let ledger = CrashLedger::open(&path).await.unwrap();
        assert!(ledger.unclean_run(None).await.is_none());
    }

    #[tokio::test]
    async fn test_second_crash_while_open_returns_open_record() {
        let dir = TempDir::new().unwrap();
        let ledger = CrashLedger::open(dir.path().join("crash.jsonl")).await.unwrap();
        ledger.mark_run_started("run-a", t(0), 4).await.unwrap();
        ledger.mark_run_started("run-b", t(60), 4).await.unwrap();

        let run_a = ledger.unclean_run(Some("run-b")).await.unwrap();
        let first = ledger.record_crash(&run_a, Some("run-b"), t(61)).await.unwrap();
        assert_eq!(first.last_known_good_record_id, 4);

        ledger.mark_run_started("run-c", t(120), 4).await.unwrap();
        let run_b = ledger.unclean_run(Some("run-c")).await.unwrap();
        assert_eq!(run_b.run_id, "run-b");
        let second = ledger.record_crash(&run_b, Some("run-c"), t(121)).await.unwrap();

        assert_eq!(first.crash_id, second.crash_id);
        assert_eq!(ledger.crashes().await.len(), 1);
        assert!(ledger.unclean_run(Some("run-c")).await.is_none());
    }

    #[tokio::test]
    async fn test_older_unclean_runs_attributed_with_newest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crash.jsonl");
        {
            let ledger = CrashLedger::open(&path).await.unwrap();
            ledger.mark_run_started("run-a", t(0), 1).await.unwrap();
            ledger.mark_run_started("run-b", t(60), 1).await.unwrap();

            let newest = ledger.unclean_run(Some("run-c")).await.unwrap();
            assert_eq!(newest.run_id, "run-b");
            ledger.mark_run_started("run-c", t(120), 1).await.unwrap();
            let crash = ledger.record_crash(&newest, Some("run-c"), t(121)).await.unwrap();
            assert_eq!(crash.crashed_run_id, "run-b");
        }

        let ledger = CrashLedger::open(&path).await.unwrap();
        assert!(ledger.unclean_run(Some("run-c")).await.is_none());
        assert_eq!(ledger.unclean_run(None).await.unwrap().run_id, "run-c");
        assert_eq!(ledger.crashes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_closes_crash_durably() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crash.jsonl");
        let crash_id = {
            let ledger = CrashLedger::open(&path).await.unwrap();
            ledger.mark_run_started("run-a", t(0), 0).await.unwrap();
            let run = ledger.unclean_run(None).await.unwrap();
            let crash = ledger.record_crash(&run, None, t(5)).await.unwrap();
            ledger.mark_recovered(crash.crash_id, t(9)).await.unwrap();
            crash.crash_id
        };

        let ledger = CrashLedger::open(&path).await.unwrap();
        assert!(ledger.open_crash().await.is_none());
        let crashes = ledger.crashes().await;
        assert_eq!(crashes[0].crash_id, crash_id);
        assert_eq!(crashes[0].recovered_at, Some(t(9)));
    }
}
