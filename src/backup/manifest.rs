use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::catalog::BackupType;
use crate::database::Dialect;
use crate::errors::{AppError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATABASE_FILE: &str = "database.sql";
pub const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub dialect: Dialect,
    pub server_version: String,
    pub tables: usize,
    pub rows: u64,
}

/// Describes an archive: where it came from and what it contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub app_version: String,
    pub backup_name: String,
    pub site_url: String,
    pub home_url: String,
    pub table_prefix: String,
    pub charset: String,
    pub created_at: DateTime<Utc>,
    pub backup_type: BackupType,
    pub incremental: bool,
    pub incremental_parent: Option<u64>,
    pub database: Option<DatabaseInfo>,
    pub file_count: usize,
}

impl BackupManifest {
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        fs::write(dir.join(MANIFEST_FILE), content)?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(AppError::Validation(format!(
                "archive has no {} at its root",
                MANIFEST_FILE
            )));
        }
        let content = fs::read(&path)?;
        serde_json::from_slice(&content)
            .map_err(|e| AppError::Validation(format!("unreadable {}: {}", MANIFEST_FILE, e)))
    }
}
