//! Storage sinks for backup artifacts.

mod cloud;
mod local;
mod upload;

pub use cloud::ObjectStoreTarget;
pub use local::LocalTarget;
pub use upload::{BackendHandle, UploadPolicy};

use crate::core::{BackendKind, Location, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A destination capable of storing and returning artifacts.
///
/// Implementations report retryable failures as `TransientBackendError`
/// and anything an operator has to fix as `FatalBackendError`.
#[async_trait]
pub trait BackendTarget: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn put(&self, relative_path: &str, bytes: Vec<u8>) -> Result<Location>;

    async fn get(&self, location: &Location) -> Result<Vec<u8>>;

    async fn exists(&self, location: &Location) -> Result<bool>;
}

/// Backend selection as it appears in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local {
        root: PathBuf,
        /// Destination for overwrite collections; defaults to `<root>/overwrite`.
        #[serde(default)]
        overwrite_root: Option<PathBuf>,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_overwrite_prefix")]
        overwrite_prefix: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        /// Where credentials come from; only `env` is understood.
        #[serde(default = "default_credentials_ref")]
        credentials_ref: String,
    },
}

fn default_overwrite_prefix() -> String {
    "overwrite".to_string()
}

fn default_credentials_ref() -> String {
    "env".to_string()
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Local { .. } => BackendKind::Local,
            BackendConfig::S3 { .. } => BackendKind::Cloud,
        }
    }
}

/// Builds the archive and overwrite targets described by `config`.
pub async fn open_targets(
    config: &BackendConfig,
) -> Result<(std::sync::Arc<dyn BackendTarget>, std::sync::Arc<dyn BackendTarget>)> {
    match config {
        BackendConfig::Local {
            root,
            overwrite_root,
        } => {
            let archive = LocalTarget::open(root).await?;
            let overwrite_root = overwrite_root
                .clone()
                .unwrap_or_else(|| root.join("overwrite"));
            let overwrite = LocalTarget::open(overwrite_root).await?;
            Ok((std::sync::Arc::new(archive), std::sync::Arc::new(overwrite)))
        }
        BackendConfig::S3 {
            bucket,
            prefix,
            overwrite_prefix,
            region,
            endpoint,
            credentials_ref,
        } => {
            let store = ObjectStoreTarget::s3_store(
                bucket,
                region.as_deref(),
                endpoint.as_deref(),
                credentials_ref,
            )?;
            let archive = ObjectStoreTarget::new(store.clone(), bucket.clone(), prefix.clone());
            let overwrite_prefix = if prefix.is_empty() {
                overwrite_prefix.clone()
            } else {
                format!("{}/{}", prefix.trim_end_matches('/'), overwrite_prefix)
            };
            let overwrite = ObjectStoreTarget::new(store, bucket.clone(), overwrite_prefix);
            Ok((std::sync::Arc::new(archive), std::sync::Arc::new(overwrite)))
        }
    }
}
