// sitevault/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::storage::settings::BackendSettings;

pub const DEFAULT_WORK_DIR: &str = "./sitevault";
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 5;
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonSiteConfig {
    pub root_dir: Option<PathBuf>,
    pub site_url: Option<String>,
    pub home_url: Option<String>,
    pub table_prefix: Option<String>,
    pub charset: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonNotificationConfig {
    pub enabled: Option<bool>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupDefaults {
    pub compression_level: Option<u32>,
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub site: Option<JsonSiteConfig>,
    pub database_url: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub exclude_files: Option<Vec<String>>,
    pub storage: Option<HashMap<String, BackendSettings>>,
    pub notifications: Option<JsonNotificationConfig>,
    pub defaults: Option<JsonBackupDefaults>,
    pub log_retention_days: Option<u32>,
    pub local_retention_days: Option<u32>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq)]
pub struct SiteConfig {
    pub root_dir: PathBuf,
    pub site_url: String,
    pub home_url: String,
    pub table_prefix: String,
    pub charset: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackupDefaults {
    pub compression_level: u32,
    pub chunk_size: usize,
}

impl Default for BackupDefaults {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub site: SiteConfig,
    pub database_url: String,
    pub work_dir: PathBuf,
    pub catalog_path: Option<PathBuf>,
    pub exclude_files: Vec<String>,
    pub storage: HashMap<String, BackendSettings>,
    pub notifications: NotificationConfig,
    pub defaults: BackupDefaults,
    pub log_retention_days: u32,
    /// Age after which completed backups lose their local copy. Unset keeps them.
    pub local_retention_days: Option<u32>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let database_url = raw
            .database_url
            .filter(|s| !s.is_empty())
            .context("database_url must be set in config.json")?;

        let site_raw = raw.site.context("site section must be set in config.json")?;
        let root_dir = site_raw
            .root_dir
            .context("site.root_dir must be set in config.json")?;
        let site_url = site_raw
            .site_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_default();
        let home_url = site_raw
            .home_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| site_url.clone());
        let site = SiteConfig {
            root_dir,
            site_url,
            home_url,
            table_prefix: site_raw.table_prefix.unwrap_or_default(),
            charset: site_raw.charset.unwrap_or_else(|| "utf8".to_string()),
        };

        let work_dir = raw
            .work_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));

        let raw_defaults = raw.defaults.unwrap_or_default();
        let defaults = BackupDefaults {
            compression_level: raw_defaults
                .compression_level
                .unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            chunk_size: raw_defaults.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
        };
        if defaults.compression_level > 9 {
            anyhow::bail!(
                "defaults.compression_level must be between 0 and 9, got {}",
                defaults.compression_level
            );
        }
        if defaults.chunk_size == 0 {
            anyhow::bail!("defaults.chunk_size must be greater than zero");
        }

        let mut storage = raw.storage.unwrap_or_default();
        if !storage.contains_key("local") {
            let local_dir = work_dir.join("backups");
            storage.insert(
                "local".to_string(),
                BackendSettings::new()
                    .with("type", "local")
                    .with("path", local_dir.to_string_lossy().to_string()),
            );
        }

        let raw_notifications = raw.notifications.unwrap_or_default();
        let webhook_url = raw_notifications.webhook_url.filter(|s| !s.is_empty());
        let notifications = NotificationConfig {
            enabled: raw_notifications.enabled.unwrap_or(webhook_url.is_some()),
            webhook_url,
        };
        if notifications.enabled && notifications.webhook_url.is_none() {
            warn!("Notifications are enabled but no webhook_url is configured; events will only be logged.");
        }

        Ok(AppConfig {
            site,
            database_url,
            catalog_path: raw.catalog_path,
            work_dir,
            exclude_files: raw.exclude_files.unwrap_or_default(),
            storage,
            notifications,
            defaults,
            log_retention_days: raw
                .log_retention_days
                .unwrap_or(DEFAULT_LOG_RETENTION_DAYS),
            local_retention_days: raw.local_retention_days.filter(|days| *days > 0),
        })
    }

    /// Directory holding staging trees and transient archives.
    pub fn temp_dir(&self) -> PathBuf {
        self.work_dir.join("temp")
    }

    /// Per-job progress files, shared between processes.
    pub fn progress_dir(&self) -> PathBuf {
        self.work_dir.join("progress")
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("catalog.json"))
    }
}
