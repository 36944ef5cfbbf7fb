//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore, watch};
use tradevault::backend::BackendConfig;
use tradevault::codec::CompressionConfig;
use tradevault::config::{CollectionConfig, ProfileConfig, Profiles};
use tradevault::ledger::LedgerConfig;
use tradevault::scheduler::SchedulerConfig;
use tradevault::version::VersionConfig;
use tradevault::{
    BackendKind, BackendTarget, BackupError, BackupKind, BackupService, CollectorConfig,
    Environment, Location, MemorySource, Result, ScheduleSpec, UploadPolicy,
};

/// 2024-01-01T00:00:00Z plus `secs`; minute boundaries fall on multiples of 60.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::TimeDelta::seconds(secs)
}

pub fn config(dir: &Path, snapshot: ScheduleSpec, stream: ScheduleSpec, margin_secs: u64) -> CollectorConfig {
    let profile = ProfileConfig {
        snapshot_cadence: snapshot,
        stream_cadence: stream,
        safe_margin_secs: margin_secs,
    };
    CollectorConfig {
        environment: Environment::Production,
        profiles: Profiles {
            development: profile.clone(),
            production: profile,
        },
        collections: vec![
            CollectionConfig {
                name: "trades".to_string(),
                kind: BackupKind::Full,
            },
            CollectionConfig {
                name: "orderbook".to_string(),
                kind: BackupKind::Incremental,
            },
        ],
        overwrite_collections: vec!["symbols".to_string()],
        overwrite_min_age_secs: 3_600,
        compression: CompressionConfig::default(),
        backend: BackendConfig::Local {
            root: dir.join("archive"),
            overwrite_root: Some(dir.join("overwrite")),
        },
        ledger: LedgerConfig {
            backup_ledger_path: dir.join("state").join("backup.jsonl"),
            crash_ledger_path: dir.join("state").join("crash.jsonl"),
        },
        version: VersionConfig {
            schema_version: 1,
            max_migration_retries: 3,
        },
        upload: UploadPolicy {
            attempt_timeout_ms: 2_000,
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            max_concurrent_uploads: 4,
        },
        scheduler: SchedulerConfig {
            tick_interval_ms: 10,
            alert_after_failures: 3,
        },
        source_dir: dir.join("live"),
    }
}

pub struct TestBed {
    pub dir: TempDir,
    pub config: CollectorConfig,
    pub source: Arc<MemorySource>,
    pub shutdown: watch::Sender<bool>,
}

impl TestBed {
    /// `every_minute` snapshots and stream flushes with a 7 second margin.
    pub fn new() -> Self {
        Self::with_cadence(
            "every_minute".parse().unwrap(),
            "every_minute".parse().unwrap(),
            7,
        )
    }

    pub fn with_cadence(snapshot: ScheduleSpec, stream: ScheduleSpec, margin_secs: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), snapshot, stream, margin_secs);
        let source = Arc::new(MemorySource::new());
        source.set_snapshot("trades", br#"[{"px":42000.5,"qty":0.1}]"#.to_vec()).unwrap();
        source.set_snapshot("symbols", br#"["BTCUSDT","ETHUSDT"]"#.to_vec()).unwrap();
        let (shutdown, _) = watch::channel(false);
        Self {
            dir,
            config,
            source,
            shutdown,
        }
    }

    /// Service over local targets inside the temp dir.
    pub async fn service(&self) -> BackupService {
        BackupService::open(&self.config, self.source.clone(), self.shutdown.subscribe())
            .await
            .unwrap()
    }

    pub async fn service_with(&self, archive: Arc<dyn BackendTarget>) -> BackupService {
        let overwrite: Arc<dyn BackendTarget> = Arc::new(MemoryTarget::new());
        BackupService::with_targets(
            &self.config,
            self.source.clone(),
            archive,
            overwrite,
            self.shutdown.subscribe(),
        )
        .await
        .unwrap()
    }
}

/// In-memory backend with failure injection and an optional gate that holds
/// every `put` until released.
pub struct MemoryTarget {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failure: Mutex<Option<BackupError>>,
    gate: Option<Arc<Semaphore>>,
    pub entered: Arc<Notify>,
    pub puts: AtomicU32,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            gate: None,
            entered: Arc::new(Notify::new()),
            puts: AtomicU32::new(0),
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn fail_with(&self, error: Option<BackupError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendTarget for MemoryTarget {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    async fn put(&self, relative_path: &str, bytes: Vec<u8>) -> Result<Location> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| BackupError::TransientBackendError("gate closed".into()))?;
        }
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(relative_path.to_string(), bytes);
        Ok(Location {
            backend: BackendKind::Cloud,
            key: relative_path.to_string(),
            uri: format!("mem://{}", relative_path),
        })
    }

    async fn get(&self, location: &Location) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&location.key)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(location.uri.clone()))
    }

    async fn exists(&self, location: &Location) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(&location.key))
    }
}
