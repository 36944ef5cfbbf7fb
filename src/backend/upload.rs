use super::BackendTarget;
use crate::core::{BackendKind, BackupError, Location, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{Duration as TokioDuration, sleep, timeout};
use tracing::{Level, event};

/// Deadline, retry and concurrency settings for uploads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadPolicy {
    /// Deadline for one upload attempt in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Maximum number of attempts per tick.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Uploads allowed in flight against one backend.
    pub max_concurrent_uploads: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 60_000,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_concurrent_uploads: 4,
        }
    }
}

impl UploadPolicy {
    /// Calculates the exponential backoff duration for a retry attempt.
    pub fn retry_backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// A backend plus the concurrency ceiling and retry loop that apply to it.
#[derive(Clone)]
pub struct BackendHandle {
    target: Arc<dyn BackendTarget>,
    permits: Arc<Semaphore>,
    policy: UploadPolicy,
}

impl BackendHandle {
    pub fn new(target: Arc<dyn BackendTarget>, policy: UploadPolicy) -> Self {
        let permits = Arc::new(Semaphore::new(policy.max_concurrent_uploads.max(1)));
        Self {
            target,
            permits,
            policy,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.target.kind()
    }

    pub fn target(&self) -> &Arc<dyn BackendTarget> {
        &self.target
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Uploads `bytes`, retrying transient failures and timeouts with
    /// exponential backoff. Fatal failures return immediately.
    pub async fn upload(&self, relative_path: &str, bytes: Vec<u8>) -> Result<Location> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackupError::FatalBackendError("upload semaphore closed".to_string()))?;

        let max_attempts = self.policy.max_attempts.max(1);
        let deadline = TokioDuration::from_millis(self.policy.attempt_timeout_ms.max(1));
        let mut attempt = 1u32;
        loop {
            let outcome = match timeout(deadline, self.target.put(relative_path, bytes.clone())).await {
                Ok(result) => result,
                Err(_) => Err(BackupError::TransientBackendError(format!(
                    "upload of '{}' exceeded {}ms",
                    relative_path, self.policy.attempt_timeout_ms
                ))),
            };

            match outcome {
                Ok(location) => return Ok(location),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let backoff = self.policy.retry_backoff_ms(attempt);
                    event!(
                        Level::WARN,
                        path = relative_path,
                        attempt,
                        backoff_ms = backoff,
                        error = %err,
                        "upload attempt failed, retrying"
                    );
                    sleep(TokioDuration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn get(&self, location: &Location) -> Result<Vec<u8>> {
        self.target.get(location).await
    }

    pub async fn exists(&self, location: &Location) -> Result<bool> {
        self.target.exists(location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        fatal: bool,
        stall: bool,
    }

    #[async_trait]
    impl BackendTarget for Scripted {
        fn kind(&self) -> BackendKind {
            BackendKind::Cloud
        }

        async fn put(&self, relative_path: &str, _bytes: Vec<u8>) -> Result<Location> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.stall {
                sleep(TokioDuration::from_secs(3600)).await;
            }
            if self.fatal {
                return Err(BackupError::FatalBackendError("invalid credentials".into()));
            }
            if call <= self.fail_first {
                return Err(BackupError::TransientBackendError("503".into()));
            }
            Ok(Location {
                backend: BackendKind::Cloud,
                key: relative_path.to_string(),
                uri: format!("s3://test/{}", relative_path),
            })
        }

        async fn get(&self, _location: &Location) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn exists(&self, _location: &Location) -> Result<bool> {
            Ok(false)
        }
    }

    fn policy(max_attempts: u32) -> UploadPolicy {
        UploadPolicy {
            attempt_timeout_ms: 50,
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            max_concurrent_uploads: 2,
        }
    }

    fn scripted(fail_first: u32, fatal: bool, stall: bool) -> Arc<Scripted> {
        Arc::new(Scripted {
            calls: AtomicU32::new(0),
            fail_first,
            fatal,
            stall,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = UploadPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            ..UploadPolicy::default()
        };
        assert_eq!(policy.retry_backoff_ms(1), 100);
        assert_eq!(policy.retry_backoff_ms(2), 200);
        assert_eq!(policy.retry_backoff_ms(3), 350);
        assert_eq!(policy.retry_backoff_ms(30), 350);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_until_success() {
        let target = scripted(2, false, false);
        let handle = BackendHandle::new(target.clone(), policy(3));
        let location = handle.upload("a.zst", vec![1]).await.unwrap();
        assert_eq!(location.key, "a.zst");
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempt_ceiling() {
        let target = scripted(10, false, false);
        let handle = BackendHandle::new(target.clone(), policy(3));
        let err = handle.upload("a.zst", vec![1]).await.unwrap_err();
        assert!(matches!(err, BackupError::TransientBackendError(_)));
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let target = scripted(0, true, false);
        let handle = BackendHandle::new(target.clone(), policy(5));
        let err = handle.upload("a.zst", vec![1]).await.unwrap_err();
        assert!(matches!(err, BackupError::FatalBackendError(_)));
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_deadline_counts_as_transient() {
        let target = scripted(0, false, true);
        let handle = BackendHandle::new(target.clone(), policy(2));
        let err = handle.upload("a.zst", vec![1]).await.unwrap_err();
        assert!(matches!(err, BackupError::TransientBackendError(_)));
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);
    }
}
