//! Remote destinations for backup archives.
//!
//! Every backend speaks the same [`StorageBackend`] contract: the locator
//! returned by `upload` is accepted back by `download`, `delete` and
//! `exists` on the same backend. Credentials and sessions live on the
//! backend instance, never in process-wide state.

pub mod backblaze;
pub mod dropbox;
pub mod ftp;
pub mod google_cloud;
pub mod google_drive;
pub mod http;
pub mod local;
pub mod onedrive;
pub mod s3;
pub mod settings;
pub mod sftp;
pub mod token;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::errors::{AppError, Result};
pub use settings::BackendSettings;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteFile {
    pub name: String,
    /// Locator accepted by `download`/`delete`/`exists`.
    pub path: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Stores `local_path` under `remote_key`; returns the locator.
    async fn upload(&self, local_path: &Path, remote_key: &str) -> anyhow::Result<String>;

    /// `Ok(false)` when the object does not exist.
    async fn download(&self, locator: &str, local_path: &Path) -> anyhow::Result<bool>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete(&self, locator: &str) -> anyhow::Result<bool>;

    async fn exists(&self, locator: &str) -> anyhow::Result<bool>;

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<RemoteFile>>;

    async fn test_connection(&self) -> anyhow::Result<bool>;
}

/// Resolves a destination's settings to a backend instance.
pub fn create_backend(
    name: &str,
    settings: &BackendSettings,
    client: &reqwest::Client,
) -> Result<Arc<dyn StorageBackend>> {
    let kind = settings.kind(name);
    let configured = |e: anyhow::Error| {
        AppError::Configuration(format!("storage destination '{}' ({}): {:#}", name, kind, e))
    };
    let backend: Arc<dyn StorageBackend> = match kind.as_str() {
        "local" => Arc::new(local::LocalStorage::from_settings(settings).map_err(configured)?),
        "s3" | "amazon_s3" => {
            Arc::new(s3::S3Storage::from_settings(settings, false).map_err(configured)?)
        }
        "custom_s3" => Arc::new(s3::S3Storage::from_settings(settings, true).map_err(configured)?),
        "dropbox" => Arc::new(
            dropbox::DropboxStorage::from_settings(settings, client.clone()).map_err(configured)?,
        ),
        "onedrive" => Arc::new(
            onedrive::OneDriveStorage::from_settings(settings, client.clone()).map_err(configured)?,
        ),
        "backblaze" | "b2" => Arc::new(
            backblaze::BackblazeStorage::from_settings(settings, client.clone())
                .map_err(configured)?,
        ),
        "google_drive" => Arc::new(
            google_drive::GoogleDriveStorage::from_settings(settings).map_err(configured)?,
        ),
        "google_cloud" | "gcs" => Arc::new(
            google_cloud::GoogleCloudStorage::from_settings(settings).map_err(configured)?,
        ),
        "ftp" => Arc::new(ftp::FtpStorage::from_settings(settings).map_err(configured)?),
        "sftp" => Arc::new(sftp::SftpStorage::from_settings(settings).map_err(configured)?),
        other => {
            return Err(AppError::Configuration(format!(
                "unsupported storage type: {}",
                other
            )));
        }
    };
    Ok(backend)
}

/// Named destinations, built lazily and cached for the engine's lifetime.
pub struct StorageRegistry {
    settings: HashMap<String, BackendSettings>,
    client: reqwest::Client,
    cache: DashMap<String, Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    pub fn new(settings: HashMap<String, BackendSettings>, client: reqwest::Client) -> Self {
        Self {
            settings,
            client,
            cache: DashMap::new(),
        }
    }

    /// Installs a ready-made backend under `name`, replacing any cached one.
    pub fn register(&self, name: &str, backend: Arc<dyn StorageBackend>) {
        self.cache.insert(name.to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageBackend>> {
        if let Some(backend) = self.cache.get(name) {
            return Ok(backend.clone());
        }
        let settings = self.settings.get(name).ok_or_else(|| {
            AppError::Configuration(format!("storage destination '{}' is not configured", name))
        })?;
        let backend = create_backend(name, settings, &self.client)?;
        self.cache.insert(name.to_string(), backend.clone());
        Ok(backend)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.settings.keys().cloned().collect();
        for entry in self.cache.iter() {
            if !names.contains(entry.key()) {
                names.push(entry.key().clone());
            }
        }
        names.sort();
        names
    }
}

/// Joins a configured folder and a key with exactly one slash.
pub(crate) fn join_key(folder: Option<&str>, key: &str) -> String {
    let key = key.trim_start_matches('/');
    match folder.map(|f| f.trim_matches('/')).filter(|f| !f.is_empty()) {
        Some(folder) if key.starts_with(&format!("{}/", folder)) => key.to_string(),
        Some(folder) => format!("{}/{}", folder, key),
        None => key.to_string(),
    }
}

/// Final path segment of a key.
pub(crate) fn base_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_unknown_type() {
        let settings = BackendSettings::new().with("type", "carrier_pigeon");
        let result = create_backend("birds", &settings, &reqwest::Client::new());
        match result {
            Err(AppError::Configuration(msg)) => {
                assert_eq!(msg, "unsupported storage type: carrier_pigeon")
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("unknown type must not resolve"),
        }
    }

    #[test]
    fn test_factory_maps_aliases() -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let s3 = BackendSettings::new()
            .with("type", "amazon_s3")
            .with("bucket", "b")
            .with("access_key", "k")
            .with("secret_key", "s");
        assert_eq!(create_backend("offsite", &s3, &client)?.kind(), "s3");

        let missing = BackendSettings::new().with("type", "dropbox");
        assert!(matches!(
            create_backend("dropbox", &missing, &client),
            Err(AppError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn test_registry_reports_unconfigured_destination() {
        let registry = StorageRegistry::new(HashMap::new(), reqwest::Client::new());
        assert!(matches!(registry.get("nowhere"), Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(Some("/backups/"), "a.tar.gz"), "backups/a.tar.gz");
        assert_eq!(join_key(Some("backups"), "backups/a.tar.gz"), "backups/a.tar.gz");
        assert_eq!(join_key(None, "/a.tar.gz"), "a.tar.gz");
        assert_eq!(base_name("backups/x/a.tar.gz"), "a.tar.gz");
    }
}
