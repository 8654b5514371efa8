use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::models::{
    BackupRecord, BackupStatus, BackupType, LogEntry, ScheduleDefinition,
};
use crate::errors::{AppError, Result};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CatalogData {
    next_backup_id: u64,
    next_schedule_id: u64,
    backups: BTreeMap<u64, BackupRecord>,
    schedules: BTreeMap<u64, ScheduleDefinition>,
    /// Only read, from catalogs written before logs had their own file.
    #[serde(default, skip_serializing)]
    logs: Vec<LogEntry>,
}

/// Backup, schedule and log store. When opened from a path, records live in
/// one JSON document and log entries in an append-only JSON-lines file next
/// to it; purely in memory otherwise.
#[derive(Debug)]
pub struct Catalog {
    path: Option<PathBuf>,
    data: Mutex<CatalogData>,
    logs: Mutex<Vec<LogEntry>>,
}

/// `catalog.json` -> `catalog.logs.jsonl`.
fn log_path(path: &Path) -> PathBuf {
    path.with_extension("logs.jsonl")
}

fn read_log_file(path: &Path) -> Result<Vec<LogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            // A torn final line from a crash must not lose the rest.
            Err(e) => warn!(path = %path.display(), "Skipping unreadable log line {}: {}", idx + 1, e),
        }
    }
    Ok(entries)
}

/// Writes `contents` to `path` through a temp file in the same directory.
fn write_atomic(path: &Path, contents: impl FnOnce(&mut fs::File) -> Result<()>) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    contents(tmp.as_file_mut())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}

impl Catalog {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(CatalogData::default()),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut data: CatalogData = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            CatalogData::default()
        };

        let mut logs = std::mem::take(&mut data.logs);
        let migrated = !logs.is_empty();
        logs.extend(read_log_file(&log_path(path))?);

        let catalog = Self {
            path: Some(path.to_path_buf()),
            data: Mutex::new(data),
            logs: Mutex::new(logs),
        };
        if migrated {
            let logs = catalog.logs.lock();
            catalog.rewrite_logs(&logs)?;
            catalog.persist(&catalog.data.lock())?;
        }
        Ok(catalog)
    }

    fn persist(&self, data: &CatalogData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_atomic(path, |file| {
            serde_json::to_writer_pretty(file, data)?;
            Ok(())
        })?;
        debug!(path = %path.display(), "catalog persisted");
        Ok(())
    }

    fn rewrite_logs(&self, logs: &[LogEntry]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_atomic(&log_path(path), |file| {
            for entry in logs {
                serde_json::to_writer(&mut *file, entry)?;
                file.write_all(b"\n")?;
            }
            Ok(())
        })
    }

    /// Applies `f` and persists. On any failure the in-memory state is
    /// restored to what it was before the call.
    fn mutate<T>(&self, f: impl FnOnce(&mut CatalogData) -> Result<T>) -> Result<T> {
        let mut guard = self.data.lock();
        let snapshot = guard.clone();
        let result = f(&mut guard).and_then(|out| self.persist(&guard).map(|_| out));
        if result.is_err() {
            *guard = snapshot;
        }
        result
    }

    /// Stores a record, assigning the next id. Returns the stored copy.
    pub fn insert_backup(&self, mut record: BackupRecord) -> Result<BackupRecord> {
        self.mutate(|data| {
            data.next_backup_id += 1;
            record.id = data.next_backup_id;
            data.backups.insert(record.id, record.clone());
            Ok(record)
        })
    }

    pub fn create_backup(
        &self,
        name: &str,
        backup_type: BackupType,
        incremental_parent: Option<u64>,
        metadata: serde_json::Value,
    ) -> Result<BackupRecord> {
        let mut record = BackupRecord::new(name, backup_type);
        record.status = BackupStatus::InProgress;
        record.incremental_parent = incremental_parent;
        record.metadata = metadata;
        self.insert_backup(record)
    }

    pub fn update_backup(
        &self,
        id: u64,
        f: impl FnOnce(&mut BackupRecord),
    ) -> Result<BackupRecord> {
        self.mutate(|data| {
            let record = data
                .backups
                .get_mut(&id)
                .ok_or_else(|| AppError::NotFound(format!("backup {}", id)))?;
            f(record);
            Ok(record.clone())
        })
    }

    pub fn get_backup(&self, id: u64) -> Option<BackupRecord> {
        self.data.lock().backups.get(&id).cloned()
    }

    /// All records, newest first.
    pub fn list_backups(&self) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self.data.lock().backups.values().cloned().collect();
        sort_newest_first(&mut records);
        records
    }

    pub fn remove_backup(&self, id: u64) -> Result<Option<BackupRecord>> {
        self.mutate(|data| Ok(data.backups.remove(&id)))
    }

    /// Completed backups of one type, newest first.
    pub fn completed_of_type(&self, backup_type: BackupType) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self
            .data
            .lock()
            .backups
            .values()
            .filter(|r| r.backup_type == backup_type && r.is_completed())
            .cloned()
            .collect();
        sort_newest_first(&mut records);
        records
    }

    pub fn latest_completed(&self, backup_type: BackupType) -> Option<BackupRecord> {
        self.completed_of_type(backup_type).into_iter().next()
    }

    pub fn add_schedule(&self, mut schedule: ScheduleDefinition) -> Result<ScheduleDefinition> {
        self.mutate(|data| {
            data.next_schedule_id += 1;
            schedule.id = data.next_schedule_id;
            data.schedules.insert(schedule.id, schedule.clone());
            Ok(schedule)
        })
    }

    pub fn update_schedule(
        &self,
        id: u64,
        f: impl FnOnce(&mut ScheduleDefinition),
    ) -> Result<ScheduleDefinition> {
        self.mutate(|data| {
            let schedule = data
                .schedules
                .get_mut(&id)
                .ok_or_else(|| AppError::NotFound(format!("schedule {}", id)))?;
            f(schedule);
            Ok(schedule.clone())
        })
    }

    pub fn get_schedule(&self, id: u64) -> Option<ScheduleDefinition> {
        self.data.lock().schedules.get(&id).cloned()
    }

    pub fn list_schedules(&self) -> Vec<ScheduleDefinition> {
        self.data.lock().schedules.values().cloned().collect()
    }

    pub fn remove_schedule(&self, id: u64) -> Result<Option<ScheduleDefinition>> {
        self.mutate(|data| Ok(data.schedules.remove(&id)))
    }

    /// Active, idle schedules whose next run is at or before `now`.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Vec<ScheduleDefinition> {
        let mut due: Vec<ScheduleDefinition> = self
            .data
            .lock()
            .schedules
            .values()
            .filter(|s| s.active && !s.running && s.next_run <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_run, s.id));
        due
    }

    /// Clears the `running` flag of schedules that started before `cutoff`
    /// (or carry no start time), left behind by a run that never finished.
    /// Returns the released schedule ids.
    pub fn release_stale_schedules(&self, cutoff: DateTime<Utc>) -> Result<Vec<u64>> {
        self.mutate(|data| {
            let mut released = Vec::new();
            for schedule in data.schedules.values_mut() {
                if schedule.running && schedule.started_at.is_none_or(|t| t < cutoff) {
                    schedule.running = false;
                    schedule.started_at = None;
                    released.push(schedule.id);
                }
            }
            Ok(released)
        })
    }

    /// Appends one line to the log file; earlier entries are never rewritten.
    pub fn append_log(&self, entry: LogEntry) -> Result<()> {
        let mut logs = self.logs.lock();
        if let Some(path) = &self.path {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path(path))?;
            file.write_all(&line)?;
        }
        logs.push(entry);
        Ok(())
    }

    pub fn logs_for(&self, job: &str) -> Vec<LogEntry> {
        self.logs
            .lock()
            .iter()
            .filter(|e| e.job == job)
            .cloned()
            .collect()
    }

    /// Drops log entries created before `cutoff`. Returns how many were removed.
    pub fn prune_logs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut logs = self.logs.lock();
        let kept: Vec<LogEntry> = logs.iter().filter(|e| e.created_at >= cutoff).cloned().collect();
        let removed = logs.len() - kept.len();
        if removed > 0 {
            self.rewrite_logs(&kept)?;
            *logs = kept;
        }
        Ok(removed)
    }
}

fn sort_newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::{Frequency, LogLevel};
    use chrono::Duration;

    fn completed(name: &str, backup_type: BackupType, age_hours: i64) -> BackupRecord {
        let mut record = BackupRecord::new(name, backup_type);
        record.status = BackupStatus::Completed;
        record.size = 10;
        record.created_at = Utc::now() - Duration::hours(age_hours);
        record
            .locations
            .insert("local".to_string(), format!("{}.tar.gz", name));
        record
    }

    #[test]
    fn test_completed_of_type_orders_newest_first() -> anyhow::Result<()> {
        let catalog = Catalog::in_memory();
        catalog.insert_backup(completed("old", BackupType::Full, 48))?;
        catalog.insert_backup(completed("new", BackupType::Full, 1))?;
        catalog.insert_backup(completed("db", BackupType::Database, 0))?;
        catalog.create_backup("running", BackupType::Full, None, serde_json::Value::Null)?;

        let full = catalog.completed_of_type(BackupType::Full);
        let names: Vec<&str> = full.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["new", "old"]);
        assert_eq!(
            catalog.latest_completed(BackupType::Database).map(|r| r.name),
            Some("db".to_string())
        );
        assert_eq!(catalog.latest_completed(BackupType::Files), None);
        Ok(())
    }

    #[test]
    fn test_due_schedules_skip_running_and_inactive() -> anyhow::Result<()> {
        let catalog = Catalog::in_memory();
        let now = Utc::now();

        let mut due = ScheduleDefinition::new("due", BackupType::Full, Frequency::Daily);
        due.next_run = now - Duration::minutes(5);
        let due = catalog.add_schedule(due)?;

        let mut later = ScheduleDefinition::new("later", BackupType::Full, Frequency::Daily);
        later.next_run = now + Duration::hours(1);
        catalog.add_schedule(later)?;

        let mut busy = ScheduleDefinition::new("busy", BackupType::Full, Frequency::Daily);
        busy.next_run = now - Duration::hours(1);
        busy.running = true;
        catalog.add_schedule(busy)?;

        let mut paused = ScheduleDefinition::new("paused", BackupType::Full, Frequency::Daily);
        paused.next_run = now - Duration::hours(1);
        paused.active = false;
        catalog.add_schedule(paused)?;

        let ids: Vec<u64> = catalog.due_schedules(now).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![due.id]);
        Ok(())
    }

    #[test]
    fn test_persisted_catalog_reloads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state").join("catalog.json");

        let catalog = Catalog::open(&path)?;
        let record = catalog.create_backup("b1", BackupType::Files, None, serde_json::json!({"k": 1}))?;
        catalog.update_backup(record.id, |r| {
            r.status = BackupStatus::Failed;
            r.error = Some("disk full".into());
        })?;
        catalog.append_log(LogEntry {
            job: "backup_1".into(),
            level: LogLevel::Error,
            message: "disk full".into(),
            created_at: Utc::now() - Duration::days(40),
        })?;
        drop(catalog);

        let reopened = Catalog::open(&path)?;
        let loaded = reopened.get_backup(record.id).expect("record survives reload");
        assert_eq!(loaded.status, BackupStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("disk full"));
        assert_eq!(reopened.logs_for("backup_1").len(), 1);

        let removed = reopened.prune_logs(Utc::now() - Duration::days(30))?;
        assert_eq!(removed, 1);

        let next = reopened.create_backup("b2", BackupType::Files, None, serde_json::Value::Null)?;
        assert_eq!(next.id, record.id + 1);
        Ok(())
    }

    #[test]
    fn test_logs_append_to_their_own_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalog.json");
        let catalog = Catalog::open(&path)?;
        catalog.create_backup("b1", BackupType::Full, None, serde_json::Value::Null)?;
        for i in 0..3 {
            catalog.append_log(LogEntry {
                job: "backup_1".into(),
                level: LogLevel::Info,
                message: format!("step {}", i),
                created_at: Utc::now() - Duration::days(i * 20),
            })?;
        }

        let lines = std::fs::read_to_string(dir.path().join("catalog.logs.jsonl"))?;
        assert_eq!(lines.lines().count(), 3);
        assert!(!std::fs::read_to_string(&path)?.contains("step 0"));

        assert_eq!(catalog.prune_logs(Utc::now() - Duration::days(30))?, 1);
        drop(catalog);
        let reopened = Catalog::open(&path)?;
        let messages: Vec<String> = reopened.logs_for("backup_1").into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["step 0".to_string(), "step 1".to_string()]);
        Ok(())
    }

    #[test]
    fn test_logs_in_catalog_document_move_to_log_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "next_backup_id": 0,
                "next_schedule_id": 0,
                "backups": {},
                "schedules": {},
                "logs": [{"job": "backup_7", "level": "info", "message": "old", "created_at": Utc::now()}]
            })
            .to_string(),
        )?;

        let catalog = Catalog::open(&path)?;
        assert_eq!(catalog.logs_for("backup_7").len(), 1);
        assert!(!std::fs::read_to_string(&path)?.contains("\"logs\""));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("catalog.logs.jsonl"))?.lines().count(),
            1
        );
        Ok(())
    }

    #[test]
    fn test_failed_persist_leaves_state_untouched() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = dir.path().join("state");
        let path = state.join("catalog.json");
        let catalog = Catalog::open(&path)?;

        std::fs::remove_dir_all(&state)?;
        assert!(catalog.insert_backup(completed("lost", BackupType::Full, 0)).is_err());
        assert!(catalog.list_backups().is_empty());

        std::fs::create_dir_all(&state)?;
        let stored = catalog.insert_backup(completed("kept", BackupType::Full, 0))?;
        assert_eq!(stored.id, 1);
        Ok(())
    }

    #[test]
    fn test_stale_running_schedules_are_released() -> anyhow::Result<()> {
        let catalog = Catalog::in_memory();
        let now = Utc::now();

        let mut crashed = ScheduleDefinition::new("crashed", BackupType::Full, Frequency::Daily);
        crashed.next_run = now - Duration::days(1);
        crashed.running = true;
        crashed.started_at = Some(now - Duration::hours(30));
        let crashed = catalog.add_schedule(crashed)?;

        let mut legacy = ScheduleDefinition::new("legacy", BackupType::Full, Frequency::Daily);
        legacy.running = true;
        let legacy = catalog.add_schedule(legacy)?;

        let mut busy = ScheduleDefinition::new("busy", BackupType::Full, Frequency::Daily);
        busy.next_run = now - Duration::hours(1);
        busy.running = true;
        busy.started_at = Some(now - Duration::minutes(10));
        let busy = catalog.add_schedule(busy)?;

        let released = catalog.release_stale_schedules(now - Duration::hours(12))?;
        assert_eq!(released, vec![crashed.id, legacy.id]);

        let due: Vec<u64> = catalog.due_schedules(now).iter().map(|s| s.id).collect();
        assert!(due.contains(&crashed.id));
        assert!(!due.contains(&busy.id));
        Ok(())
    }

    #[test]
    fn test_update_missing_backup_is_not_found() {
        let catalog = Catalog::in_memory();
        let result = catalog.update_backup(99, |r| r.size = 1);
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
