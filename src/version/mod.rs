//! Backup schema version and migration retry bookkeeping.

use crate::core::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{Level, event};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Failed migration attempts tolerated before new writes halt.
    #[serde(default = "default_max_migration_retries")]
    pub max_migration_retries: u32,
}

fn default_schema_version() -> u32 {
    1
}

fn default_max_migration_retries() -> u32 {
    3
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            max_migration_retries: default_max_migration_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    pub current_version: u32,
    pub retry_count: u32,
}

#[derive(Debug)]
struct CoordinatorState {
    version: VersionState,
    migration_target: Option<u32>,
    exhausted: Option<BackupError>,
}

/// Sole owner of [`VersionState`]. Shared by the writers through an `Arc`;
/// every read and update goes through one lock.
#[derive(Debug)]
pub struct VersionCoordinator {
    state: Mutex<CoordinatorState>,
    max_retries: u32,
}

impl VersionCoordinator {
    pub fn new(config: &VersionConfig) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                version: VersionState {
                    current_version: config.schema_version,
                    retry_count: 0,
                },
                migration_target: None,
                exhausted: None,
            }),
            max_retries: config.max_migration_retries.max(1),
        }
    }

    pub fn state(&self) -> Result<VersionState> {
        Ok(self.state.lock()?.version)
    }

    pub fn migration_target(&self) -> Result<Option<u32>> {
        Ok(self.state.lock()?.migration_target)
    }

    pub fn is_halted(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.exhausted.is_some())
            .unwrap_or(true)
    }

    /// Version to stamp on the record about to be written.
    ///
    /// While a migration is pending the old version is still returned.
    /// Once the retry ceiling is hit, every call fails.
    pub fn stamp(&self) -> Result<u32> {
        let state = self.state.lock()?;
        if let Some(err) = &state.exhausted {
            return Err(err.clone());
        }
        Ok(state.version.current_version)
    }

    /// Signals that a migration to `target` has started.
    pub fn begin_migration(&self, target: u32) -> Result<()> {
        let mut state = self.state.lock()?;
        if let Some(err) = &state.exhausted {
            return Err(err.clone());
        }
        if target <= state.version.current_version {
            return Err(BackupError::ConfigError(format!(
                "migration target {} is not newer than current version {}",
                target, state.version.current_version
            )));
        }
        state.migration_target = Some(target);
        event!(
            Level::INFO,
            from = state.version.current_version,
            to = target,
            "schema migration started"
        );
        Ok(())
    }

    /// Records one failed migration attempt. Returns the new retry count, or
    /// `VersionMigrationExhausted` once the ceiling is reached.
    pub fn migration_failed(&self) -> Result<u32> {
        let mut state = self.state.lock()?;
        if let Some(err) = &state.exhausted {
            return Err(err.clone());
        }
        let target = state.migration_target.ok_or_else(|| {
            BackupError::NotFound("no schema migration in progress".to_string())
        })?;

        state.version.retry_count += 1;
        let retry_count = state.version.retry_count;
        if retry_count >= self.max_retries {
            let err = BackupError::VersionMigrationExhausted {
                target,
                retries: retry_count,
            };
            event!(
                Level::ERROR,
                target,
                retry_count,
                "schema migration retries exhausted, halting backups"
            );
            state.exhausted = Some(err.clone());
            return Err(err);
        }

        event!(Level::WARN, target, retry_count, "schema migration attempt failed");
        Ok(retry_count)
    }

    /// Switches to the migration target.
    pub fn complete_migration(&self) -> Result<u32> {
        let mut state = self.state.lock()?;
        if let Some(err) = &state.exhausted {
            return Err(err.clone());
        }
        let target = state.migration_target.take().ok_or_else(|| {
            BackupError::NotFound("no schema migration in progress".to_string())
        })?;
        state.version = VersionState {
            current_version: target,
            retry_count: 0,
        };
        event!(Level::INFO, version = target, "schema migration completed");
        Ok(target)
    }

    /// A record stamped with `version` reached the ledger.
    pub fn record_success(&self, version: u32) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.exhausted.is_none() && version == state.version.current_version {
            state.version.retry_count = 0;
        }
        Ok(())
    }
}
