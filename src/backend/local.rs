use super::BackendTarget;
use crate::core::{BackendKind, BackupError, Location, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{Level, event};

const TEMP_PREFIX: &str = ".tv-partial-";

/// Filesystem target. Every write lands under a temporary name in the
/// destination directory and is renamed into place after `fsync`.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    root: PathBuf,
}

impl LocalTarget {
    /// Creates `root` if needed and removes partial files left by a crash.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|err| {
            BackupError::FatalBackendError(format!(
                "Failed to create backup root '{}': {}",
                root.display(),
                err
            ))
        })?;

        let target = Self { root };
        let swept = target.sweep_partial_files().await?;
        if swept > 0 {
            event!(Level::INFO, root = %target.root.display(), swept, "removed partial artifacts");
        }
        Ok(target)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        let relative = Path::new(relative_path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative_path.is_empty() || escapes {
            return Err(BackupError::FatalBackendError(format!(
                "Artifact path '{}' must be relative and stay under the backup root",
                relative_path
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn sweep_partial_files(&self) -> Result<usize> {
        let mut removed = 0usize;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|err| BackupError::IoError(err.to_string()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| BackupError::IoError(err.to_string()))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| BackupError::IoError(err.to_string()))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    fs::remove_file(&path)
                        .await
                        .map_err(|err| BackupError::IoError(err.to_string()))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn location_for(&self, relative_path: &str, path: &Path) -> Location {
        Location {
            backend: BackendKind::Local,
            key: relative_path.to_string(),
            uri: format!("file://{}", path.display()),
        }
    }
}

fn classify_io(context: &str, err: std::io::Error) -> BackupError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => {
            BackupError::FatalBackendError(format!("{}: {}", context, err))
        }
        _ => BackupError::TransientBackendError(format!("{}: {}", context, err)),
    }
}

#[async_trait]
impl BackendTarget for LocalTarget {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn put(&self, relative_path: &str, bytes: Vec<u8>) -> Result<Location> {
        let path = self.resolve(relative_path)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .map_err(|err| classify_io("create artifact directory", err))?;

        let final_path = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&parent)
                .map_err(|err| classify_io("create temp artifact", err))?;
            tmp.write_all(&bytes)
                .map_err(|err| classify_io("write temp artifact", err))?;
            tmp.as_file()
                .sync_all()
                .map_err(|err| classify_io("sync temp artifact", err))?;
            tmp.persist(&final_path)
                .map_err(|err| classify_io("rename artifact into place", err.error))?;
            // Make the rename itself durable; not every platform can open a directory.
            if let Ok(dir) = std::fs::File::open(&parent) {
                let _ = dir.sync_all();
            }
            Ok(())
        })
        .await
        .map_err(|err| BackupError::TransientBackendError(format!("local put join: {}", err)))??;

        Ok(self.location_for(relative_path, &path))
    }

    async fn get(&self, location: &Location) -> Result<Vec<u8>> {
        if location.backend != BackendKind::Local {
            return Err(BackupError::FatalBackendError(format!(
                "Location '{}' does not belong to a local backend",
                location
            )));
        }
        let path = self.resolve(&location.key)?;
        fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BackupError::NotFound(location.to_string())
            } else {
                classify_io("read artifact", err)
            }
        })
    }

    async fn exists(&self, location: &Location) -> Result<bool> {
        if location.backend != BackendKind::Local {
            return Ok(false);
        }
        let path = self.resolve(&location.key)?;
        fs::try_exists(&path)
            .await
            .map_err(|err| classify_io("stat artifact", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_exists() {
        let dir = TempDir::new().unwrap();
        let target = LocalTarget::open(dir.path()).await.unwrap();

        let location = target
            .put("orderbook/orderbook_2024_3_9_14_28_min.full.zst", b"payload".to_vec())
            .await
            .unwrap();
        assert_eq!(location.backend, BackendKind::Local);
        assert!(target.exists(&location).await.unwrap());
        assert_eq!(target.get(&location).await.unwrap(), b"payload".to_vec());
    }

    #[tokio::test]
    async fn test_put_replaces_existing_file_whole() {
        let dir = TempDir::new().unwrap();
        let target = LocalTarget::open(dir.path()).await.unwrap();
        target.put("ticker.zst", vec![1u8; 4096]).await.unwrap();
        let location = target.put("ticker.zst", vec![2u8; 16]).await.unwrap();
        assert_eq!(target.get(&location).await.unwrap(), vec![2u8; 16]);
    }

    #[tokio::test]
    async fn test_open_sweeps_partial_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("full")).unwrap();
        std::fs::write(dir.path().join("full").join(".tv-partial-abc"), b"half").unwrap();
        std::fs::write(dir.path().join("full").join("kept.zst"), b"whole").unwrap();

        LocalTarget::open(dir.path()).await.unwrap();

        assert!(!dir.path().join("full").join(".tv-partial-abc").exists());
        assert!(dir.path().join("full").join("kept.zst").exists());
    }

    #[tokio::test]
    async fn test_rejects_paths_escaping_root() {
        let dir = TempDir::new().unwrap();
        let target = LocalTarget::open(dir.path()).await.unwrap();
        let err = target.put("../outside.bin", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, BackupError::FatalBackendError(_)));
    }
}
