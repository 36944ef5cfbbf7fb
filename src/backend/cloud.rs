use super::BackendTarget;
use crate::codec::checksum;
use crate::core::{BackendKind, BackupError, Location, Result};
use async_trait::async_trait;
use object_store::aws::{AmazonS3Builder, Checksum};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

/// Cloud object storage target over any `object_store` implementation.
///
/// S3 uploads carry a SHA-256 content checksum verified by the service.
#[derive(Debug, Clone)]
pub struct ObjectStoreTarget {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ObjectStoreTarget {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Builds an S3 client. Credentials are read from the standard AWS
    /// environment variables and never from the configuration file.
    pub fn s3_store(
        bucket: &str,
        region: Option<&str>,
        endpoint: Option<&str>,
        credentials_ref: &str,
    ) -> Result<Arc<dyn ObjectStore>> {
        if credentials_ref != "env" {
            return Err(BackupError::ConfigError(format!(
                "Unsupported credentials_ref '{}'; expected 'env'",
                credentials_ref
            )));
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_checksum_algorithm(Checksum::SHA256);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|err| BackupError::FatalBackendError(format!("S3 client: {}", err)))?;
        Ok(Arc::new(store))
    }

    fn object_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn location_for(&self, key: &str, path: &ObjectPath) -> Location {
        Location {
            backend: BackendKind::Cloud,
            key: key.to_string(),
            uri: format!("s3://{}/{}", self.bucket, path),
        }
    }

    fn ensure_cloud(location: &Location) -> Result<()> {
        if location.backend == BackendKind::Cloud {
            Ok(())
        } else {
            Err(BackupError::FatalBackendError(format!(
                "Location '{}' does not belong to a cloud backend",
                location
            )))
        }
    }
}

/// Credential and addressing problems need an operator; everything else
/// (throttling, connection resets, 5xx) is worth another attempt.
fn classify_store_error(context: &str, err: object_store::Error) -> BackupError {
    use object_store::Error as StoreError;
    match err {
        StoreError::NotFound { path, .. } => BackupError::NotFound(path),
        StoreError::PermissionDenied { .. }
        | StoreError::Unauthenticated { .. }
        | StoreError::InvalidPath { .. }
        | StoreError::NotSupported { .. }
        | StoreError::NotImplemented
        | StoreError::UnknownConfigurationKey { .. } => {
            BackupError::FatalBackendError(format!("{}: {}", context, err))
        }
        other => BackupError::TransientBackendError(format!("{}: {}", context, other)),
    }
}

#[async_trait]
impl BackendTarget for ObjectStoreTarget {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    async fn put(&self, relative_path: &str, bytes: Vec<u8>) -> Result<Location> {
        let path = self.object_path(relative_path);
        let digest = checksum(&bytes);
        self.store
            .put(&path, PutPayload::from(bytes))
            .await
            .map_err(|err| classify_store_error("cloud put", err))?;
        tracing::debug!(uri = %path, sha256 = %digest, "artifact uploaded");
        Ok(self.location_for(relative_path, &path))
    }

    async fn get(&self, location: &Location) -> Result<Vec<u8>> {
        Self::ensure_cloud(location)?;
        let path = self.object_path(&location.key);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|err| classify_store_error("cloud get", err))?;
        let bytes = result
            .bytes()
            .await
            .map_err(|err| classify_store_error("cloud read body", err))?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, location: &Location) -> Result<bool> {
        if location.backend != BackendKind::Cloud {
            return Ok(false);
        }
        let path = self.object_path(&location.key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(classify_store_error("cloud head", err)),
        }
    }
}
