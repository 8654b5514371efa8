//! Collaborator-facing facade over the orchestrators.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::backup::{self, BackupOptions, BackupOutcome};
use crate::catalog::{BackupRecord, Catalog};
use crate::config::AppConfig;
use crate::database::{connect_database, Database};
use crate::errors::Result;
use crate::migration::{self, SearchReplaceOptions, SearchReplaceReport};
use crate::restore::{self, RestoreOptions, RestoreOutcome};
use crate::scheduler::{self, ScheduleRun};
use crate::storage::StorageRegistry;
use crate::utils::notify::{notifier_from_config, Notifier};
use crate::utils::progress::{PROGRESS_TTL, ProgressRecord, ProgressTracker};

/// Staging trees older than this are considered orphaned.
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything a job needs. Shared by the backup, restore and scheduler
/// orchestrators.
pub struct EngineContext {
    pub config: AppConfig,
    pub catalog: Arc<Catalog>,
    pub db: Arc<dyn Database>,
    pub storage: Arc<StorageRegistry>,
    pub progress: ProgressTracker,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Engine {
    ctx: EngineContext,
}

impl Engine {
    /// Opens the catalog, connects the database and prepares the work dir.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(config.temp_dir()).await?;
        let progress_dir = config.progress_dir();
        let catalog = Arc::new(Catalog::open(&config.catalog_file())?);
        let db = connect_database(&config.database_url).await?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("sitevault/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let storage = Arc::new(StorageRegistry::new(config.storage.clone(), http.clone()));
        let notifier = notifier_from_config(&config.notifications, http);
        info!(
            "Engine ready: site {} ({} destinations configured)",
            config.site.root_dir.display(),
            config.storage.len()
        );
        Ok(Self::new(EngineContext {
            config,
            catalog,
            db,
            storage,
            progress: ProgressTracker::persistent(progress_dir, PROGRESS_TTL),
            notifier,
        }))
    }

    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn catalog(&self) -> &Catalog {
        &self.ctx.catalog
    }

    pub async fn create_backup(&self, options: BackupOptions) -> BackupOutcome {
        backup::run_backup(&self.ctx, options).await
    }

    pub async fn restore_backup(&self, backup_id: u64, options: RestoreOptions) -> RestoreOutcome {
        restore::run_restore(&self.ctx, backup_id, options, None).await
    }

    pub async fn delete_backup(&self, backup_id: u64) -> Result<bool> {
        backup::delete_backup(&self.ctx, backup_id).await
    }

    pub async fn run_due_schedules(&self) -> Vec<ScheduleRun> {
        scheduler::run_due_schedules(&self.ctx).await
    }

    /// Rewrites `search` to `replace` in every text column, or only in
    /// `tables` when given.
    pub async fn search_replace(
        &self,
        search: &str,
        replace: &str,
        tables: Option<Vec<String>>,
    ) -> SearchReplaceReport {
        let options = SearchReplaceOptions {
            tables: tables.unwrap_or_default(),
            ..SearchReplaceOptions::default()
        };
        migration::search_replace(self.ctx.db.as_ref(), search, replace, &options).await
    }

    pub fn progress(&self, job_id: &str) -> Option<ProgressRecord> {
        self.ctx.progress.get(job_id)
    }

    pub fn list_backups(&self) -> Vec<BackupRecord> {
        self.ctx.catalog.list_backups()
    }

    pub async fn test_destination(&self, name: &str) -> Result<bool> {
        let backend = self.ctx.storage.get(name)?;
        Ok(backend.test_connection().await?)
    }

    /// Drops log entries older than `days`. Returns how many were removed.
    pub fn prune_logs(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let removed = self.ctx.catalog.prune_logs(cutoff)?;
        info!("Pruned {} log entries older than {} days", removed, days);
        Ok(removed)
    }

    /// Deletes local copies of completed backups older than `days`.
    pub async fn prune_local_copies(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let removed = scheduler::prune_local_copies(&self.ctx, cutoff).await?;
        info!("Removed {} local copies older than {} days", removed, days);
        Ok(removed)
    }

    /// Removes staging trees and archives left behind by interrupted jobs,
    /// along with expired progress and stale schedule locks.
    pub async fn sweep_stale_staging(&self, max_age: Duration) -> Result<usize> {
        self.ctx.progress.sweep();
        let released = self
            .ctx
            .catalog
            .release_stale_schedules(Utc::now() - scheduler::STALE_SCHEDULE_AGE)?;
        if !released.is_empty() {
            info!("Released stale running schedules {:?}", released);
        }
        let temp_dir = self.ctx.config.temp_dir();
        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            if !temp_dir.is_dir() {
                return Ok(0);
            }
            let now = SystemTime::now();
            let mut removed = 0;
            for entry in std::fs::read_dir(&temp_dir)? {
                let entry = entry?;
                let path = entry.path();
                let modified = entry.metadata().and_then(|m| m.modified())?;
                let age = now.duration_since(modified).unwrap_or_default();
                if age < max_age {
                    continue;
                }
                let outcome = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match outcome {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove stale {}: {}", path.display(), e),
                }
            }
            Ok(removed)
        })
        .await??;
        if removed > 0 {
            info!("Removed {} stale staging entries", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{BackupDefaults, NotificationConfig, SiteConfig};
    use crate::database::SqliteDatabase;
    use crate::storage::{BackendSettings, RemoteFile, StorageBackend};
    use crate::utils::notify::Notification;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::TempDir;

    pub(crate) const SITE_URL: &str = "http://old.example.com";

    /// Rejects every operation.
    pub(crate) struct FailingStorage;

    #[async_trait]
    impl StorageBackend for FailingStorage {
        fn kind(&self) -> &'static str {
            "failing"
        }

        async fn upload(&self, _local_path: &Path, _remote_key: &str) -> anyhow::Result<String> {
            anyhow::bail!("connection refused")
        }

        async fn download(&self, _locator: &str, _local_path: &Path) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }

        async fn delete(&self, _locator: &str) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }

        async fn exists(&self, _locator: &str) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }

        async fn list(&self, _prefix: &str) -> anyhow::Result<Vec<RemoteFile>> {
            anyhow::bail!("connection refused")
        }

        async fn test_connection(&self) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
            self.sent.lock().push(notification.clone());
            Ok(())
        }
    }

    pub(crate) struct TestEnv {
        pub ctx: EngineContext,
        pub site: TempDir,
        pub work: TempDir,
        pub sqlite: SqliteDatabase,
        notifier: Arc<RecordingNotifier>,
    }

    impl TestEnv {
        pub fn notifications(&self) -> Vec<Notification> {
            self.notifier.sent.lock().clone()
        }
    }

    /// A small CMS-like site: two tables in an in-memory SQLite database, a
    /// site tree, and two local destinations ("local" and "mirror").
    pub(crate) async fn test_context() -> anyhow::Result<TestEnv> {
        let site = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;

        let sqlite = SqliteDatabase::connect("sqlite::memory:").await?;
        let db: Arc<dyn Database> = Arc::new(sqlite.clone());
        db.execute(
            "CREATE TABLE wp_options (option_id INTEGER PRIMARY KEY, option_name TEXT NOT NULL, option_value TEXT)",
        )
        .await?;
        db.execute(&format!(
            "INSERT INTO wp_options (option_id, option_name, option_value) VALUES \
             (1, 'siteurl', '{url}'), \
             (2, 'widget', 'a:1:{{s:4:\"link\";s:{len}:\"{url}/about\";}}'), \
             (3, 'blank', NULL)",
            url = SITE_URL,
            len = SITE_URL.len() + "/about".len(),
        ))
        .await?;
        db.execute("CREATE TABLE wp_posts (id INTEGER PRIMARY KEY, title TEXT, views INTEGER)")
            .await?;
        db.execute("INSERT INTO wp_posts (id, title, views) VALUES (1, 'Hello; world', 10), (2, 'It''s here', 0)")
            .await?;

        let mut storage = HashMap::new();
        for name in ["local", "mirror"] {
            storage.insert(
                name.to_string(),
                BackendSettings::new()
                    .with("type", "local")
                    .with("path", work.path().join(name).to_string_lossy().to_string()),
            );
        }

        let config = AppConfig {
            site: SiteConfig {
                root_dir: site.path().to_path_buf(),
                site_url: SITE_URL.to_string(),
                home_url: SITE_URL.to_string(),
                table_prefix: "wp_".to_string(),
                charset: "utf8".to_string(),
            },
            database_url: "sqlite::memory:".to_string(),
            work_dir: work.path().join("work"),
            catalog_path: None,
            exclude_files: Vec::new(),
            storage: storage.clone(),
            notifications: NotificationConfig::default(),
            defaults: BackupDefaults::default(),
            log_retention_days: 30,
            local_retention_days: None,
        };
        std::fs::create_dir_all(config.temp_dir())?;

        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = EngineContext {
            config,
            catalog: Arc::new(Catalog::in_memory()),
            db,
            storage: Arc::new(StorageRegistry::new(storage, reqwest::Client::new())),
            progress: ProgressTracker::new(),
            notifier: notifier.clone(),
        };
        Ok(TestEnv {
            ctx,
            site,
            work,
            sqlite,
            notifier,
        })
    }

    #[tokio::test]
    async fn test_prune_logs_keeps_recent_entries() -> anyhow::Result<()> {
        let env = test_context().await?;
        let engine = Engine::new(env.ctx);
        let catalog = engine.context().catalog.clone();
        catalog.append_log(crate::catalog::LogEntry {
            job: "backup_1".into(),
            level: crate::catalog::LogLevel::Info,
            message: "old".into(),
            created_at: Utc::now() - ChronoDuration::days(40),
        })?;
        catalog.append_log(crate::catalog::LogEntry {
            job: "backup_1".into(),
            level: crate::catalog::LogLevel::Info,
            message: "new".into(),
            created_at: Utc::now(),
        })?;

        assert_eq!(engine.prune_logs(30)?, 1);
        let remaining = catalog.logs_for("backup_1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message, "new");
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_entries() -> anyhow::Result<()> {
        let env = test_context().await?;
        let temp = env.ctx.config.temp_dir();
        std::fs::create_dir_all(temp.join("backup_dead_2024-01-01_00-00-00"))?;
        std::fs::write(temp.join("backup_dead.tar.gz"), b"partial")?;
        let engine = Engine::new(env.ctx);

        assert_eq!(engine.sweep_stale_staging(STALE_STAGING_AGE).await?, 0);
        assert_eq!(engine.sweep_stale_staging(Duration::ZERO).await?, 2);
        assert_eq!(std::fs::read_dir(&temp)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_destination_checks() -> anyhow::Result<()> {
        let env = test_context().await?;
        env.ctx.storage.register("broken", Arc::new(FailingStorage));
        let engine = Engine::new(env.ctx);

        assert!(engine.test_destination("local").await?);
        assert!(!engine.test_destination("broken").await?);
        assert!(engine.test_destination("nowhere").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_search_replace_through_facade() -> anyhow::Result<()> {
        let env = test_context().await?;
        let engine = Engine::new(env.ctx);
        let report = engine
            .search_replace(SITE_URL, "https://new.example.org", Some(vec!["wp_options".into()]))
            .await;
        assert_eq!(report.tables_scanned, 1);
        assert_eq!(report.cells_changed, 2);
        assert!(report.errors.is_empty());
        Ok(())
    }
}
