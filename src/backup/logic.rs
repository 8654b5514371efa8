use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::archive::create_tar_gz_archive;
use super::db_dump::dump_database;
use super::file_collector::{collect_incremental, stage_files, FileCollector};
use super::manifest::{BackupManifest, DatabaseInfo, DATABASE_FILE, FILES_DIR};
use crate::catalog::{BackupRecord, BackupStatus, BackupType};
use crate::engine::EngineContext;
use crate::errors::{AppError, Result};
use crate::utils::logger::JobLogger;
use crate::utils::notify::{send_notification, Notification, NotificationEvent};
use crate::utils::progress::{band, ProgressReporter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupOptions {
    #[serde(alias = "type")]
    pub backup_type: BackupType,
    pub exclude_tables: Vec<String>,
    pub exclude_files: Vec<String>,
    /// 0 (store) to 9; the configured default when unset.
    pub compression_level: Option<u32>,
    /// Rows per INSERT statement; the configured default when unset.
    pub chunk_size: Option<usize>,
    pub destinations: Vec<String>,
    pub incremental: bool,
    pub incremental_parent: Option<u64>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            backup_type: BackupType::Full,
            exclude_tables: Vec::new(),
            exclude_files: Vec::new(),
            compression_level: None,
            chunk_size: None,
            destinations: vec!["local".to_string()],
            incremental: false,
            incremental_parent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupOutcome {
    pub success: bool,
    pub backup_id: Option<u64>,
    pub message: String,
}

pub fn backup_job_id(backup_id: u64) -> String {
    format!("backup_{}", backup_id)
}

fn generate_backup_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("backup_{}_{}", &id[..8], Utc::now().format("%Y-%m-%d_%H-%M-%S"))
}

/// Site-relative form of the work dir when it lives inside the site, so the
/// engine never archives its own staging area.
fn work_dir_exclusion(root: &Path, work_dir: &Path) -> Option<String> {
    let root = root.canonicalize().ok()?;
    let work = work_dir.canonicalize().ok()?;
    let relative = work.strip_prefix(&root).ok()?;
    let relative = relative.to_string_lossy().replace('\\', "/");
    (!relative.is_empty()).then_some(relative)
}

/// Resolves the incremental parent: an explicit id wins, otherwise the most
/// recent completed backup of the same type. `None` means a full run.
fn resolve_parent(ctx: &EngineContext, options: &BackupOptions) -> Option<u64> {
    if !options.incremental || !options.backup_type.allows_incremental() {
        return None;
    }
    options
        .incremental_parent
        .or_else(|| ctx.catalog.latest_completed(options.backup_type).map(|r| r.id))
}

struct Job<'a> {
    ctx: &'a EngineContext,
    record: BackupRecord,
    options: &'a BackupOptions,
    staging: PathBuf,
    archive_path: PathBuf,
    reporter: ProgressReporter,
    logger: JobLogger,
}

/// Runs one backup job end to end. Never returns an error: failures are
/// recorded on the catalog record and reported in the outcome.
pub async fn run_backup(ctx: &EngineContext, options: BackupOptions) -> BackupOutcome {
    let name = generate_backup_name();
    let parent = resolve_parent(ctx, &options);
    if options.incremental && parent.is_none() {
        warn!("No completed {} backup to build on; running a full backup", options.backup_type);
    }

    let metadata = serde_json::to_value(&options).unwrap_or_default();
    let record = match ctx
        .catalog
        .create_backup(&name, options.backup_type, parent, metadata)
    {
        Ok(record) => record,
        Err(e) => {
            return BackupOutcome {
                success: false,
                backup_id: None,
                message: format!("Failed to register backup: {}", e),
            };
        }
    };

    let job_id = backup_job_id(record.id);
    let reporter = ctx.progress.reporter(&job_id);
    reporter.update("initializing", 0, "Initializing backup...");
    let logger = JobLogger::new(ctx.catalog.clone(), &job_id);
    logger.info(format!("Starting {} backup {}", options.backup_type, name));

    let temp_dir = ctx.config.temp_dir();
    let job = Job {
        ctx,
        staging: temp_dir.join(&name),
        archive_path: temp_dir.join(record.archive_file_name()),
        record,
        options: &options,
        reporter,
        logger,
    };

    let result = job.execute().await;
    job.cleanup().await;
    job.finish(result).await
}

impl Job<'_> {
    async fn execute(&self) -> Result<(u64, usize)> {
        self.reporter.update("preparing", 5, "Preparing backup...");
        tokio::fs::create_dir_all(&self.staging).await?;

        let database = if self.record.backup_type.includes_database() {
            Some(self.dump_database().await?)
        } else {
            None
        };

        let file_count = if self.record.backup_type.includes_files() {
            self.collect_files().await?
        } else {
            0
        };

        let site = &self.ctx.config.site;
        let manifest = BackupManifest {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            backup_name: self.record.name.clone(),
            site_url: site.site_url.clone(),
            home_url: site.home_url.clone(),
            table_prefix: site.table_prefix.clone(),
            charset: site.charset.clone(),
            created_at: self.record.created_at,
            backup_type: self.record.backup_type,
            incremental: self.record.incremental_parent.is_some(),
            incremental_parent: self.record.incremental_parent,
            database,
            file_count,
        };
        manifest.write_to(&self.staging)?;

        let size = self.compress().await?;
        let delivered = self.deliver().await?;
        Ok((size, delivered))
    }

    async fn dump_database(&self) -> Result<DatabaseInfo> {
        self.reporter.update("database", 10, "Backing up database...");
        let db = self.ctx.db.as_ref();
        let chunk_size = self
            .options
            .chunk_size
            .unwrap_or(self.ctx.config.defaults.chunk_size);
        let reporter = self.reporter.clone();
        let on_table = move |done: usize, total: usize, table: &str| {
            reporter.item(
                "database",
                band(10, 30, done, total),
                format!("Exporting table {}/{}", (done + 1).min(total), total),
                table,
            );
        };
        let summary = dump_database(
            db,
            &self.staging.join(DATABASE_FILE),
            &self.options.exclude_tables,
            chunk_size,
            &on_table,
        )
        .await?;
        self.logger.info(format!(
            "Database exported: {} tables, {} rows",
            summary.tables, summary.rows
        ));
        Ok(DatabaseInfo {
            dialect: db.dialect(),
            server_version: db.server_version().await?,
            tables: summary.tables,
            rows: summary.rows,
        })
    }

    async fn collect_files(&self) -> Result<usize> {
        self.reporter.update("files", 30, "Collecting files...");
        let config = &self.ctx.config;
        let root = config.site.root_dir.clone();

        let mut exclusions = config.exclude_files.clone();
        exclusions.extend(self.options.exclude_files.iter().cloned());
        exclusions.extend(work_dir_exclusion(&root, &config.work_dir));
        let collector = FileCollector::new(root.clone(), exclusions);

        let catalog = self.ctx.catalog.clone();
        let parent = self.record.incremental_parent;
        let collected = tokio::task::spawn_blocking(move || match parent {
            Some(parent_id) => collect_incremental(&catalog, &collector, parent_id),
            None => collector.collect_full(),
        })
        .await??;
        self.logger.info(format!(
            "Collected {} files ({} bytes){}",
            collected.count(),
            collected.total_size,
            if parent.is_some() { " changed since parent" } else { "" }
        ));

        let dest = self.staging.join(FILES_DIR);
        let reporter = self.reporter.clone();
        let summary = tokio::task::spawn_blocking(move || {
            stage_files(&root, &collected, &dest, &|done, total, path| {
                if done % 50 == 0 {
                    reporter.item(
                        "files",
                        band(30, 70, done, total),
                        format!("Copying files {}/{}", done, total),
                        path.to_string_lossy(),
                    );
                }
            })
        })
        .await??;
        if summary.failed > 0 {
            self.logger
                .warning(format!("{} files could not be copied and were skipped", summary.failed));
        }
        Ok(summary.copied)
    }

    async fn compress(&self) -> Result<u64> {
        self.reporter.update("compressing", 70, "Creating archive...");
        let level = self
            .options
            .compression_level
            .unwrap_or(self.ctx.config.defaults.compression_level);
        let staging = self.staging.clone();
        let archive = self.archive_path.clone();
        let size = tokio::task::spawn_blocking(move || create_tar_gz_archive(&staging, &archive, level))
            .await??;
        self.ctx.catalog.update_backup(self.record.id, |r| r.size = size)?;
        self.reporter.update("compressing", 85, "Archive created");
        Ok(size)
    }

    /// Uploads to every destination concurrently. Each success is recorded
    /// as soon as it lands; failures are logged and skipped.
    async fn deliver(&self) -> Result<usize> {
        self.reporter.update("uploading", 85, "Uploading backup...");
        let destinations = &self.options.destinations;
        let key = self.record.archive_file_name();
        let finished = AtomicUsize::new(0);
        let total = destinations.len();

        let uploads = destinations.iter().map(|destination| {
            let key = key.as_str();
            let finished = &finished;
            async move {
                let result = match self.ctx.storage.get(destination) {
                    Ok(backend) => backend
                        .upload(&self.archive_path, key)
                        .await
                        .map_err(|e| format!("{:#}", e)),
                    Err(e) => Err(e.to_string()),
                };
                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                self.reporter.item(
                    "uploading",
                    band(85, 100, done, total),
                    format!("Uploaded to {}/{} destinations", done, total),
                    destination.as_str(),
                );
                (destination, result)
            }
        });

        let mut delivered = 0;
        for (destination, result) in join_all(uploads).await {
            match result {
                Ok(locator) => {
                    self.ctx.catalog.update_backup(self.record.id, |r| {
                        r.locations.insert(destination.clone(), locator.clone());
                    })?;
                    self.logger.info(format!("Uploaded to {}: {}", destination, locator));
                    delivered += 1;
                }
                Err(message) => {
                    let err = AppError::Transfer {
                        destination: destination.clone(),
                        message,
                    };
                    self.logger.warning(err.to_string());
                }
            }
        }

        if delivered == 0 {
            return Err(AppError::Transfer {
                destination: destinations.join(", "),
                message: "no destination accepted the archive".to_string(),
            });
        }
        Ok(delivered)
    }

    async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staging dir {}: {}", self.staging.display(), e);
            }
        }
        if let Err(e) = tokio::fs::remove_file(&self.archive_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove archive {}: {}", self.archive_path.display(), e);
            }
        }
    }

    async fn finish(&self, result: Result<(u64, usize)>) -> BackupOutcome {
        let id = self.record.id;
        let job_id = self.reporter.job_id().to_string();
        match result {
            Ok((size, delivered)) => {
                let updated = self.ctx.catalog.update_backup(id, |r| {
                    r.status = BackupStatus::Completed;
                    r.size = size;
                    r.completed_at = Some(Utc::now());
                });
                if let Err(e) = updated {
                    warn!("Failed to mark backup {} completed: {}", id, e);
                }
                let message = format!(
                    "Backup {} completed ({} bytes, {} of {} destinations)",
                    self.record.name,
                    size,
                    delivered,
                    self.options.destinations.len()
                );
                self.reporter.update("completed", 100, &message);
                self.logger.info(&message);
                info!("{}", message);
                send_notification(
                    self.ctx.notifier.as_ref(),
                    Notification {
                        event: NotificationEvent::BackupCompleted,
                        job: job_id,
                        subject: format!("Backup {} completed", self.record.name),
                        message: message.clone(),
                    },
                )
                .await;
                BackupOutcome {
                    success: true,
                    backup_id: Some(id),
                    message,
                }
            }
            Err(e) => {
                let message = format!("Backup failed: {}", e);
                let updated = self.ctx.catalog.update_backup(id, |r| {
                    r.status = BackupStatus::Failed;
                    r.completed_at = Some(Utc::now());
                    r.error = Some(e.to_string());
                });
                if let Err(update_err) = updated {
                    warn!("Failed to mark backup {} failed: {}", id, update_err);
                }
                let current = self.reporter.percentage();
                self.reporter.update("failed", current, &message);
                self.logger.error(&message);
                send_notification(
                    self.ctx.notifier.as_ref(),
                    Notification {
                        event: NotificationEvent::BackupFailed,
                        job: job_id,
                        subject: format!("Backup {} failed", self.record.name),
                        message: message.clone(),
                    },
                )
                .await;
                BackupOutcome {
                    success: false,
                    backup_id: Some(id),
                    message,
                }
            }
        }
    }
}

/// Removes a backup from every recorded destination (best effort), then
/// from the catalog. `Ok(false)` when the id is unknown.
pub async fn delete_backup(ctx: &EngineContext, backup_id: u64) -> Result<bool> {
    let Some(record) = ctx.catalog.get_backup(backup_id) else {
        return Ok(false);
    };
    let logger = JobLogger::new(ctx.catalog.clone(), backup_job_id(backup_id));

    for (destination, locator) in &record.locations {
        let outcome = match ctx.storage.get(destination) {
            Ok(backend) => backend.delete(locator).await.map_err(|e| format!("{:#}", e)),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(true) => logger.info(format!("Deleted {} from {}", locator, destination)),
            Ok(false) => logger.warning(format!("{} was already gone from {}", locator, destination)),
            Err(e) => logger.warning(format!("Failed to delete {} from {}: {}", locator, destination, e)),
        }
    }

    ctx.catalog.remove_backup(backup_id)?;
    logger.info(format!("Backup {} deleted", record.name));
    Ok(true)
}
