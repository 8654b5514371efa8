use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

use super::db_restore::{restore_database, PrefixRewrite};
use super::verification::verify_archive;
use crate::backup::archive::extract_tar_gz_archive;
use crate::backup::manifest::{BackupManifest, DATABASE_FILE, FILES_DIR};
use crate::backup::{run_backup, BackupOptions};
use crate::catalog::{BackupRecord, BackupType};
use crate::engine::EngineContext;
use crate::errors::{AppError, Result};
use crate::migration::{search_replace, SearchReplaceOptions};
use crate::utils::logger::JobLogger;
use crate::utils::notify::{send_notification, Notification, NotificationEvent};
use crate::utils::progress::{band, ProgressReporter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    pub restore_database: bool,
    pub restore_files: bool,
    /// Rewrite the archived site/home URLs to the configured ones.
    pub update_urls: bool,
    /// Take a full local backup before touching anything.
    pub create_restore_point: bool,
    /// Table prefix to restore under; the configured prefix when unset.
    pub target_table_prefix: Option<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            restore_database: true,
            restore_files: true,
            update_urls: true,
            create_restore_point: false,
            target_table_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreOutcome {
    pub success: bool,
    pub message: String,
    pub session_id: String,
}

pub fn new_session_id() -> String {
    format!("restore_{}", Uuid::new_v4().simple())
}

/// Destinations to try, local copies first.
fn download_order(record: &BackupRecord) -> Vec<(&String, &String)> {
    let mut order: Vec<(&String, &String)> = record.locations.iter().collect();
    order.sort_by_key(|(name, _)| name.as_str() != "local");
    order
}

/// Copies the archived tree onto the site root, overwriting existing files.
fn copy_tree(
    src: &Path,
    dest: &Path,
    on_file: &(dyn Fn(usize, &Path) + Send + Sync),
) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
            on_file(copied, relative);
        }
    }
    Ok(copied)
}

struct Session<'a> {
    ctx: &'a EngineContext,
    record: BackupRecord,
    options: &'a RestoreOptions,
    workspace: PathBuf,
    reporter: ProgressReporter,
    logger: JobLogger,
}

/// Restores backup `backup_id` onto the configured site. Never returns an
/// error; the outcome carries the failure message and the session id used
/// for progress polling.
pub async fn run_restore(
    ctx: &EngineContext,
    backup_id: u64,
    options: RestoreOptions,
    session_id: Option<String>,
) -> RestoreOutcome {
    let session_id = session_id.unwrap_or_else(new_session_id);
    let reporter = ctx.progress.reporter(&session_id);
    let logger = JobLogger::new(ctx.catalog.clone(), &session_id);
    reporter.update("initializing", 0, "Initializing restore...");

    let record = match ctx.catalog.get_backup(backup_id) {
        Some(record) if record.is_completed() => record,
        Some(record) => {
            let err = AppError::Validation(format!(
                "backup {} is {:?} and cannot be restored",
                record.id, record.status
            ));
            return fail(ctx, &reporter, &logger, &session_id, err).await;
        }
        None => {
            let err = AppError::NotFound(format!("backup {}", backup_id));
            return fail(ctx, &reporter, &logger, &session_id, err).await;
        }
    };
    logger.info(format!("Restoring backup {} ({})", record.name, record.backup_type));

    let session = Session {
        ctx,
        workspace: ctx.config.temp_dir().join(&session_id),
        record,
        options: &options,
        reporter: reporter.clone(),
        logger: logger.clone(),
    };
    let result = session.execute().await;
    session.cleanup().await;

    match result {
        Ok(()) => {
            let message = format!("Backup {} restored", session.record.name);
            reporter.update("completed", 100, &message);
            logger.info(&message);
            send_notification(
                ctx.notifier.as_ref(),
                Notification {
                    event: NotificationEvent::RestoreCompleted,
                    job: session_id.clone(),
                    subject: format!("Restore of {} completed", session.record.name),
                    message: message.clone(),
                },
            )
            .await;
            RestoreOutcome {
                success: true,
                message,
                session_id,
            }
        }
        Err(e) => fail(ctx, &reporter, &logger, &session_id, e).await,
    }
}

async fn fail(
    ctx: &EngineContext,
    reporter: &ProgressReporter,
    logger: &JobLogger,
    session_id: &str,
    err: AppError,
) -> RestoreOutcome {
    let message = format!("Restore failed: {}", err);
    reporter.update("failed", reporter.percentage(), &message);
    logger.error(&message);
    send_notification(
        ctx.notifier.as_ref(),
        Notification {
            event: NotificationEvent::RestoreFailed,
            job: session_id.to_string(),
            subject: "Restore failed".to_string(),
            message: message.clone(),
        },
    )
    .await;
    RestoreOutcome {
        success: false,
        message,
        session_id: session_id.to_string(),
    }
}

impl Session<'_> {
    async fn execute(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.workspace).await?;
        let archive = self.download().await?;

        self.reporter.update("extracting", 20, "Extracting backup archive...");
        let extract_dir = self.workspace.join("extract");
        let target = extract_dir.clone();
        tokio::task::spawn_blocking(move || extract_tar_gz_archive(&archive, &target)).await??;

        self.reporter.update("validating", 30, "Validating backup...");
        let check = verify_archive(
            &extract_dir,
            self.ctx.db.dialect(),
            self.options.restore_database,
            self.options.restore_files,
        )?;
        for warning in &check.warnings {
            self.logger.warning(warning);
        }
        let manifest = check.manifest;

        if self.options.create_restore_point {
            self.create_restore_point().await;
        }

        let database_restored = if self.options.restore_database && manifest.database.is_some() {
            self.restore_database(&extract_dir, &manifest).await?;
            true
        } else {
            false
        };

        if self.options.restore_files && manifest.backup_type.includes_files() {
            self.restore_files(&extract_dir).await?;
        }

        if self.options.update_urls && database_restored {
            self.update_urls(&manifest).await;
        }
        Ok(())
    }

    async fn download(&self) -> Result<PathBuf> {
        self.reporter.update("downloading", 5, "Downloading backup archive...");
        let archive = self.workspace.join(self.record.archive_file_name());

        for (destination, locator) in download_order(&self.record) {
            let backend = match self.ctx.storage.get(destination) {
                Ok(backend) => backend,
                Err(e) => {
                    self.logger.warning(format!("Skipping {}: {}", destination, e));
                    continue;
                }
            };
            match backend.download(locator, &archive).await {
                Ok(true) => {
                    self.logger.info(format!("Downloaded {} from {}", locator, destination));
                    return Ok(archive);
                }
                Ok(false) => self
                    .logger
                    .warning(format!("{} is missing from {}", locator, destination)),
                Err(e) => self.logger.warning(format!(
                    "Download from {} failed: {:#}",
                    destination, e
                )),
            }
        }

        Err(AppError::Transfer {
            destination: self
                .record
                .locations
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            message: "archive could not be fetched from any destination".to_string(),
        })
    }

    async fn create_restore_point(&self) {
        self.reporter.update("restore_point", 40, "Creating restore point...");
        let options = BackupOptions {
            backup_type: BackupType::Full,
            destinations: vec!["local".to_string()],
            ..BackupOptions::default()
        };
        let outcome = run_backup(self.ctx, options).await;
        if outcome.success {
            self.logger.info(format!(
                "Restore point created as backup {}",
                outcome.backup_id.unwrap_or_default()
            ));
        } else {
            self.logger
                .warning(format!("Restore point could not be created: {}", outcome.message));
        }
    }

    fn target_prefix(&self) -> String {
        self.options
            .target_table_prefix
            .clone()
            .unwrap_or_else(|| self.ctx.config.site.table_prefix.clone())
    }

    async fn restore_database(&self, extract_dir: &Path, manifest: &BackupManifest) -> Result<()> {
        self.reporter.update("database", 50, "Restoring database...");
        let target_prefix = self.target_prefix();
        let rewrite = (!manifest.table_prefix.is_empty() && manifest.table_prefix != target_prefix)
            .then(|| PrefixRewrite {
                from: manifest.table_prefix.clone(),
                to: target_prefix,
            });
        if let Some(rewrite) = &rewrite {
            self.logger.info(format!(
                "Renaming tables from prefix '{}' to '{}'",
                rewrite.from, rewrite.to
            ));
        }

        let reporter = self.reporter.clone();
        let on_progress = move |done: u64, total: u64| {
            reporter.update(
                "database",
                band(50, 70, done as usize, total as usize),
                "Restoring database...",
            );
        };
        let statements = restore_database(
            self.ctx.db.as_ref(),
            &extract_dir.join(DATABASE_FILE),
            rewrite.as_ref(),
            &on_progress,
        )
        .await?;
        self.logger
            .info(format!("Database restored ({} statements)", statements));
        Ok(())
    }

    async fn restore_files(&self, extract_dir: &Path) -> Result<()> {
        self.reporter.update("files", 70, "Restoring files...");
        let source = extract_dir.join(FILES_DIR);
        if !source.is_dir() {
            return Ok(());
        }
        let root = self.ctx.config.site.root_dir.clone();
        let reporter = self.reporter.clone();
        let copied = tokio::task::spawn_blocking(move || {
            let total = WalkDir::new(&source)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count();
            copy_tree(&source, &root, &|done, path| {
                if done % 50 == 0 || done == total {
                    reporter.item(
                        "files",
                        band(70, 85, done, total),
                        format!("Restoring files {}/{}", done, total),
                        path.to_string_lossy(),
                    );
                }
            })
        })
        .await??;
        self.logger.info(format!("Restored {} files", copied));
        Ok(())
    }

    /// Rewrites the archived URLs to the configured ones in the restored
    /// tables. Failures here are reported but do not undo the restore.
    async fn update_urls(&self, manifest: &BackupManifest) {
        self.reporter.update("urls", 85, "Updating URLs...");
        let prefix = self.target_prefix();
        let tables = match self.ctx.db.list_tables().await {
            Ok(tables) => tables
                .into_iter()
                .filter(|t| t.starts_with(&prefix))
                .collect::<Vec<_>>(),
            Err(e) => {
                self.logger.warning(format!("URL update skipped: {}", e));
                return;
            }
        };
        if tables.is_empty() {
            return;
        }
        let options = SearchReplaceOptions {
            tables,
            ..SearchReplaceOptions::default()
        };
        let site = &self.ctx.config.site;
        let mut pairs: Vec<(&str, &str)> = Vec::new();
        for (old, new) in [
            (manifest.site_url.as_str(), site.site_url.as_str()),
            (manifest.home_url.as_str(), site.home_url.as_str()),
        ] {
            if !old.is_empty() && !new.is_empty() && old != new && !pairs.contains(&(old, new)) {
                pairs.push((old, new));
            }
        }

        for (old, new) in pairs {
            let report = search_replace(self.ctx.db.as_ref(), old, new, &options).await;
            self.logger.info(format!(
                "Replaced {} with {} in {} cells across {} tables",
                old, new, report.cells_changed, report.tables_scanned
            ));
            for error in report.errors {
                self.logger.warning(format!("URL update: {}", error));
            }
        }
    }

    async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove restore workspace {}: {}", self.workspace.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{delete_backup, run_backup, BackupOptions};
    use crate::database::{Database, SqlValue};
    use crate::engine::tests::{test_context, SITE_URL};

    async fn rows(db: &dyn Database, table: &str) -> anyhow::Result<Vec<Vec<SqlValue>>> {
        let columns = db.columns(table).await?;
        let key = db.row_key(table).await?;
        Ok(db.fetch_rows(table, &columns, &key, 0, 100).await?)
    }

    #[tokio::test]
    async fn test_round_trip_restores_rows_and_files() -> anyhow::Result<()> {
        let env = test_context().await?;
        let ctx = &env.ctx;
        let site = env.site.path();
        std::fs::create_dir_all(site.join("wp-content/themes/plain"))?;
        std::fs::write(site.join("index.php"), b"<?php require 'wp-blog-header.php';")?;
        std::fs::write(site.join("wp-content/themes/plain/style.css"), b"body { margin: 0 }")?;
        std::fs::write(site.join("logo.bin"), [0u8, 159, 146, 150, 255])?;

        let options_before = rows(ctx.db.as_ref(), "wp_options").await?;
        let posts_before = rows(ctx.db.as_ref(), "wp_posts").await?;

        let backup = run_backup(ctx, BackupOptions::default()).await;
        assert!(backup.success, "{}", backup.message);
        let id = backup.backup_id.ok_or_else(|| anyhow::anyhow!("no id"))?;

        ctx.db.execute("DELETE FROM wp_posts WHERE id = 1").await?;
        ctx.db
            .execute("UPDATE wp_options SET option_value = 'changed' WHERE option_id = 1")
            .await?;
        std::fs::write(site.join("index.php"), b"defaced")?;
        std::fs::remove_file(site.join("wp-content/themes/plain/style.css"))?;

        let outcome = run_restore(ctx, id, RestoreOptions::default(), None).await;
        assert!(outcome.success, "{}", outcome.message);
        assert!(outcome.session_id.starts_with("restore_"));

        assert_eq!(rows(ctx.db.as_ref(), "wp_options").await?, options_before);
        assert_eq!(rows(ctx.db.as_ref(), "wp_posts").await?, posts_before);
        assert_eq!(std::fs::read(site.join("index.php"))?, b"<?php require 'wp-blog-header.php';");
        assert_eq!(
            std::fs::read(site.join("wp-content/themes/plain/style.css"))?,
            b"body { margin: 0 }"
        );
        assert_eq!(std::fs::read(site.join("logo.bin"))?, vec![0u8, 159, 146, 150, 255]);

        let progress = ctx
            .progress
            .get(&outcome.session_id)
            .ok_or_else(|| anyhow::anyhow!("no progress"))?;
        assert_eq!((progress.status.as_str(), progress.percentage), ("completed", 100));
        assert!(!ctx.config.temp_dir().join(&outcome.session_id).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_migration_rewrites_urls_and_prefix() -> anyhow::Result<()> {
        let mut env = test_context().await?;
        let backup = run_backup(
            &env.ctx,
            BackupOptions {
                backup_type: BackupType::Database,
                ..BackupOptions::default()
            },
        )
        .await;
        let id = backup.backup_id.ok_or_else(|| anyhow::anyhow!("no id"))?;

        let new_url = "https://www.new-site.example.org";
        env.ctx.config.site.site_url = new_url.to_string();
        env.ctx.config.site.home_url = new_url.to_string();
        env.ctx.config.site.table_prefix = "site2_".to_string();

        let ctx = &env.ctx;
        let outcome = run_restore(ctx, id, RestoreOptions::default(), None).await;
        assert!(outcome.success, "{}", outcome.message);

        let db = ctx.db.as_ref();
        let migrated = rows(db, "site2_options").await?;
        assert_eq!(migrated[0][2], SqlValue::Text(new_url.to_string()));
        let widget = format!(
            "a:1:{{s:4:\"link\";s:{}:\"{}/about\";}}",
            new_url.len() + "/about".len(),
            new_url
        );
        assert_eq!(migrated[1][2], SqlValue::Text(widget));
        assert_eq!(migrated[2][2], SqlValue::Null);

        // The tables under the old prefix are left as they were.
        let original = rows(db, "wp_options").await?;
        assert_eq!(original[0][2], SqlValue::Text(SITE_URL.to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_falls_back_to_next_destination() -> anyhow::Result<()> {
        let env = test_context().await?;
        let ctx = &env.ctx;
        let backup = run_backup(
            ctx,
            BackupOptions {
                backup_type: BackupType::Database,
                destinations: vec!["local".into(), "mirror".into()],
                ..BackupOptions::default()
            },
        )
        .await;
        let id = backup.backup_id.ok_or_else(|| anyhow::anyhow!("no id"))?;
        let record = ctx.catalog.get_backup(id).ok_or_else(|| anyhow::anyhow!("no record"))?;
        std::fs::remove_file(&record.locations["local"])?;

        let outcome = run_restore(ctx, id, RestoreOptions::default(), None).await;
        assert!(outcome.success, "{}", outcome.message);
        let logs = ctx.catalog.logs_for(&outcome.session_id);
        assert!(logs.iter().any(|l| l.message.contains("missing from local")));
        assert!(logs.iter().any(|l| l.message.contains("from mirror")));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_or_unreachable_backup_fails() -> anyhow::Result<()> {
        let env = test_context().await?;
        let ctx = &env.ctx;

        let outcome = run_restore(ctx, 42, RestoreOptions::default(), Some("restore_fixed".into())).await;
        assert!(!outcome.success);
        assert_eq!(outcome.session_id, "restore_fixed");
        assert!(outcome.message.contains("backup 42"));

        let backup = run_backup(
            ctx,
            BackupOptions {
                backup_type: BackupType::Database,
                ..BackupOptions::default()
            },
        )
        .await;
        let id = backup.backup_id.ok_or_else(|| anyhow::anyhow!("no id"))?;
        let record = ctx.catalog.get_backup(id).ok_or_else(|| anyhow::anyhow!("no record"))?;
        std::fs::remove_file(&record.locations["local"])?;

        let outcome = run_restore(ctx, id, RestoreOptions::default(), None).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("could not be fetched"));
        assert!(delete_backup(ctx, id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_point_is_taken_first() -> anyhow::Result<()> {
        let env = test_context().await?;
        let ctx = &env.ctx;
        let backup = run_backup(
            ctx,
            BackupOptions {
                backup_type: BackupType::Database,
                ..BackupOptions::default()
            },
        )
        .await;
        let id = backup.backup_id.ok_or_else(|| anyhow::anyhow!("no id"))?;

        let options = RestoreOptions {
            create_restore_point: true,
            ..RestoreOptions::default()
        };
        let outcome = run_restore(ctx, id, options, None).await;
        assert!(outcome.success, "{}", outcome.message);

        let full = ctx.catalog.completed_of_type(BackupType::Full);
        assert_eq!(full.len(), 1);
        Ok(())
    }
}
