//! Collector configuration.
//!
//! Read once at startup from a JSON file. The running service never re-reads
//! it; reloading means calling [`CollectorConfig::load`] again and building a
//! new service.

use crate::backend::{BackendConfig, UploadPolicy};
use crate::codec::{Codec, CompressionConfig};
use crate::core::{BackupError, BackupKind, Result};
use crate::ledger::LedgerConfig;
use crate::schedule::ScheduleSpec;
use crate::scheduler::SchedulerConfig;
use crate::version::VersionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Overrides `environment` from the file when set.
pub const ENVIRONMENT_VAR: &str = "TRADEVAULT_ENV";

/// Upper bound for `overwrite_min_age_secs`: one leap year.
pub const MAX_OVERWRITE_MIN_AGE_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => f.write_str("development"),
            Environment::Production => f.write_str("production"),
        }
    }
}

impl FromStr for Environment {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(BackupError::ConfigError(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Cadences of one environment as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileConfig {
    pub snapshot_cadence: ScheduleSpec,
    pub stream_cadence: ScheduleSpec,
    pub safe_margin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profiles {
    pub development: ProfileConfig,
    pub production: ProfileConfig,
}

/// The cadence set in force for this process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleProfile {
    pub mode: Environment,
    pub snapshot_cadence: ScheduleSpec,
    pub stream_cadence: ScheduleSpec,
    pub safe_margin: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionConfig {
    pub name: String,
    /// `full` for snapshots; `incremental` (or `orderbook`) for delta streams.
    pub kind: BackupKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub environment: Environment,
    pub profiles: Profiles,
    pub collections: Vec<CollectionConfig>,
    #[serde(default)]
    pub overwrite_collections: Vec<String>,
    #[serde(default = "default_overwrite_min_age_secs")]
    pub overwrite_min_age_secs: u64,
    #[serde(default)]
    pub compression: CompressionConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub version: VersionConfig,
    #[serde(default)]
    pub upload: UploadPolicy,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
}

fn default_overwrite_min_age_secs() -> u64 {
    3_600
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("data/live")
}

impl CollectorConfig {
    /// Reads, applies the environment override, and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            BackupError::ConfigError(format!("Failed to read '{}': {}", path.display(), err))
        })?;
        let mut config = Self::parse(&content)?;
        if let Ok(value) = std::env::var(ENVIRONMENT_VAR) {
            config.environment = value.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses without validating or consulting the environment.
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|err| BackupError::ConfigError(format!("Invalid configuration: {}", err)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.collections.is_empty() {
            return Err(BackupError::ConfigError(
                "at least one collection must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for collection in &self.collections {
            validate_collection_name(&collection.name)?;
            if !seen.insert((collection.name.as_str(), collection.kind)) {
                return Err(BackupError::ConfigError(format!(
                    "collection '{}' is listed twice as {}",
                    collection.name, collection.kind
                )));
            }
        }
        for name in &self.overwrite_collections {
            validate_collection_name(name)?;
        }
        if self.overwrite_min_age_secs > MAX_OVERWRITE_MIN_AGE_SECS {
            return Err(BackupError::ConfigError(format!(
                "overwrite_min_age_secs {} exceeds the maximum of {}",
                self.overwrite_min_age_secs, MAX_OVERWRITE_MIN_AGE_SECS
            )));
        }

        for (mode, profile) in [
            (Environment::Development, &self.profiles.development),
            (Environment::Production, &self.profiles.production),
        ] {
            if Duration::from_secs(profile.safe_margin_secs) >= profile.stream_cadence.period() {
                return Err(BackupError::ConfigError(format!(
                    "{} profile: safe margin {}s must be shorter than stream cadence {}",
                    mode, profile.safe_margin_secs, profile.stream_cadence
                )));
            }
        }

        Codec::new(&self.compression)?;

        if self.upload.max_attempts == 0 || self.upload.max_concurrent_uploads == 0 {
            return Err(BackupError::ConfigError(
                "upload.max_attempts and upload.max_concurrent_uploads must be positive".to_string(),
            ));
        }
        if self.version.max_migration_retries == 0 {
            return Err(BackupError::ConfigError(
                "version.max_migration_retries must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn active_profile(&self) -> ScheduleProfile {
        let profile = match self.environment {
            Environment::Development => &self.profiles.development,
            Environment::Production => &self.profiles.production,
        };
        ScheduleProfile {
            mode: self.environment,
            snapshot_cadence: profile.snapshot_cadence,
            stream_cadence: profile.stream_cadence,
            safe_margin: Duration::from_secs(profile.safe_margin_secs),
        }
    }

    pub fn collections_of(&self, kind: BackupKind) -> Vec<String> {
        self.collections
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Names become path segments of artifacts.
fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BackupError::ConfigError(format!(
            "invalid collection name '{}'",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionAlgorithm;
    use crate::schedule::NamedCadence;

    const SAMPLE: &str = r#"{
        "environment": "development",
        "profiles": {
            "development": { "snapshot_cadence": 120, "stream_cadence": "30s", "safe_margin_secs": 5 },
            "production": { "snapshot_cadence": "every_hour", "stream_cadence": "every_minute", "safe_margin_secs": 7 }
        },
        "collections": [
            { "name": "btc_trades", "kind": "full" },
            { "name": "btc_orderbook", "kind": "orderbook" }
        ],
        "overwrite_collections": ["symbols"],
        "compression": { "default": "lz4", "allowed": ["zstd", "lz4"] },
        "backend": { "kind": "local", "root": "/var/backups/tradevault" },
        "upload": { "max_attempts": 3 }
    }"#;

    #[test]
    fn test_parse_and_select_profile() {
        let mut config = CollectorConfig::parse(SAMPLE).unwrap();
        config.validate().unwrap();

        let dev = config.active_profile();
        assert_eq!(dev.mode, Environment::Development);
        assert_eq!(dev.snapshot_cadence, ScheduleSpec::every_seconds(120).unwrap());
        assert_eq!(dev.stream_cadence, ScheduleSpec::every_seconds(30).unwrap());

        config.environment = Environment::Production;
        let prod = config.active_profile();
        assert_eq!(
            prod.stream_cadence,
            ScheduleSpec::Named(NamedCadence::EveryMinute)
        );
        assert_eq!(prod.safe_margin, Duration::from_secs(7));

        assert_eq!(config.collections_of(BackupKind::Incremental), vec!["btc_orderbook"]);
        assert_eq!(config.compression.default, CompressionAlgorithm::Lz4);
        assert_eq!(config.upload.max_attempts, 3);
        assert_eq!(config.upload.attempt_timeout_ms, 60_000);
        assert_eq!(config.overwrite_min_age_secs, 3_600);
    }

    #[test]
    fn test_margin_must_be_shorter_than_stream_cadence() {
        let mut config = CollectorConfig::parse(SAMPLE).unwrap();
        config.profiles.production.safe_margin_secs = 60;
        assert!(matches!(config.validate(), Err(BackupError::ConfigError(_))));
    }

    #[test]
    fn test_unknown_cadence_token_rejected() {
        let broken = SAMPLE.replace("every_hour", "every_week");
        assert!(matches!(
            CollectorConfig::parse(&broken),
            Err(BackupError::ConfigError(_))
        ));
    }

    #[test]
    fn test_default_algorithm_outside_allow_list_rejected() {
        let broken = SAMPLE.replace(r#""default": "lz4""#, r#""default": "none""#);
        let config = CollectorConfig::parse(&broken).unwrap();
        assert!(matches!(
            config.validate(),
            Err(BackupError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_collection_names_are_path_safe() {
        let broken = SAMPLE.replace("btc_trades", "../etc");
        let config = CollectorConfig::parse(&broken).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overwrite_min_age_is_bounded() {
        let mut config = CollectorConfig::parse(SAMPLE).unwrap();
        config.overwrite_min_age_secs = MAX_OVERWRITE_MIN_AGE_SECS;
        config.validate().unwrap();

        config.overwrite_min_age_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(BackupError::ConfigError(_))));
    }

    #[test]
    fn test_shipped_example_config_is_valid() {
        let config =
            CollectorConfig::parse(include_str!("../../configs/collector.example.json")).unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.collections_of(BackupKind::Full),
            vec!["trades", "funding_rates"]
        );
        assert_eq!(
            config.profiles.development.snapshot_cadence,
            ScheduleSpec::every_seconds(30).unwrap()
        );
    }
}
