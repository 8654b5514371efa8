use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::{BackendSettings, RemoteFile, StorageBackend};

/// Keeps archives in a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        let base = settings
            .get_str("path")
            .or_else(|| settings.get_str("directory"))
            .context("missing required setting 'path'")?;
        Ok(Self::new(base))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Accepts either a locator returned by `upload` or a bare key.
    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let candidate = Path::new(locator);
        if candidate.is_absolute() {
            if candidate.starts_with(&self.base_dir) {
                return Ok(candidate.to_path_buf());
            }
            anyhow::bail!("{} is outside {}", locator, self.base_dir.display());
        }
        if candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            anyhow::bail!("invalid storage key '{}'", locator);
        }
        Ok(self.base_dir.join(candidate))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let target = self.resolve(remote_key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::copy(local_path, &target).await.with_context(|| {
            format!("Failed to copy {} to {}", local_path.display(), target.display())
        })?;
        Ok(target.to_string_lossy().to_string())
    }

    async fn download(&self, locator: &str, local_path: &Path) -> Result<bool> {
        let source = self.resolve(locator)?;
        if !fs::try_exists(&source).await? {
            return Ok(false);
        }
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&source, local_path).await.with_context(|| {
            format!("Failed to copy {} to {}", source.display(), local_path.display())
        })?;
        Ok(true)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let path = self.resolve(locator)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        let path = self.resolve(locator)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteFile>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(prefix) {
                continue;
            }
            files.push(RemoteFile {
                path: entry.path().to_string_lossy().to_string(),
                size: metadata.len(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                name,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn test_connection(&self) -> Result<bool> {
        fs::create_dir_all(&self.base_dir).await?;
        let marker = self.base_dir.join(".sitevault-write-check");
        fs::write(&marker, b"ok").await?;
        fs::remove_file(&marker).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_locator_round_trip() -> anyhow::Result<()> {
        let store_dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let archive = work.path().join("backup_1.tar.gz");
        std::fs::write(&archive, b"archive-bytes")?;

        let storage = LocalStorage::new(store_dir.path());
        let locator = storage.upload(&archive, "backup_1.tar.gz").await?;
        assert!(storage.exists(&locator).await?);
        assert!(storage.exists("backup_1.tar.gz").await?);

        let listed = storage.list("backup_").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 13);

        let restored = work.path().join("restored.tar.gz");
        assert!(storage.download(&locator, &restored).await?);
        assert_eq!(std::fs::read(&restored)?, b"archive-bytes");

        assert!(storage.delete(&locator).await?);
        assert!(!storage.delete(&locator).await?);
        assert!(!storage.download(&locator, &restored).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let storage = LocalStorage::new("/srv/backups");
        assert!(storage.exists("../etc/passwd").await.is_err());
        assert!(storage.exists("/etc/passwd").await.is_err());
    }
}
