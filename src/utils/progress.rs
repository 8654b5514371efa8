use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifetime of a progress record after its last update.
pub const PROGRESS_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub status: String,
    pub percentage: u8,
    pub message: String,
    pub current_item: Option<String>,
}

#[derive(Debug)]
struct ProgressEntry {
    record: ProgressRecord,
    updated_at: Instant,
    persisted_at: Option<Instant>,
}

/// On-disk form, readable by other processes.
#[derive(Debug, Serialize, Deserialize)]
struct StoredProgress {
    record: ProgressRecord,
    updated_at: DateTime<Utc>,
}

/// In-flight job progress keyed by job id. Entries expire after the TTL.
/// A persistent tracker also mirrors each record to `<dir>/<job>.json` so a
/// separate process can follow a running job.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    entries: Arc<DashMap<String, ProgressEntry>>,
    ttl: Duration,
    dir: Option<Arc<PathBuf>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::with_ttl(PROGRESS_TTL)
    }
}

/// Job ids become file names; anything beyond `[A-Za-z0-9_-]` is refused.
fn is_safe_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn expired(updated_at: DateTime<Utc>, ttl: Duration) -> bool {
    (Utc::now() - updated_at).to_std().is_ok_and(|age| age >= ttl)
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            dir: None,
        }
    }

    pub fn persistent(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: Some(Arc::new(dir.into())),
            ..Self::with_ttl(ttl)
        }
    }

    fn file_for(&self, job_id: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        is_safe_job_id(job_id).then(|| dir.join(format!("{}.json", job_id)))
    }

    pub fn set(&self, job_id: &str, record: ProgressRecord) {
        // The file is rewritten on a stage or percentage change, and often
        // enough within a long step that readers never see it expire.
        let refresh = self.ttl / 4;
        let previous = self.entries.get(job_id).map(|e| {
            let changed =
                e.record.status != record.status || e.record.percentage != record.percentage;
            (changed, e.persisted_at)
        });
        let due = match previous {
            None => true,
            Some((changed, persisted_at)) => {
                changed || persisted_at.is_none_or(|at| at.elapsed() >= refresh)
            }
        };
        let mut persisted_at = previous.and_then(|(_, at)| at);
        if due {
            if let Some(path) = self.file_for(job_id) {
                match write_stored(&path, &record) {
                    Ok(()) => persisted_at = Some(Instant::now()),
                    Err(e) => debug!("Failed to persist progress for {}: {}", job_id, e),
                }
            }
        }
        self.entries.insert(
            job_id.to_string(),
            ProgressEntry {
                record,
                updated_at: Instant::now(),
                persisted_at,
            },
        );
    }

    pub fn get(&self, job_id: &str) -> Option<ProgressRecord> {
        let expired_here = match self.entries.get(job_id) {
            Some(entry) if entry.updated_at.elapsed() < self.ttl => {
                return Some(entry.record.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired_here {
            let ttl = self.ttl;
            self.entries
                .remove_if(job_id, |_, entry| entry.updated_at.elapsed() >= ttl);
        }
        self.read_stored(job_id)
    }

    /// Record written by any process sharing the directory.
    fn read_stored(&self, job_id: &str) -> Option<ProgressRecord> {
        let path = self.file_for(job_id)?;
        let stored: StoredProgress = serde_json::from_slice(&std::fs::read(&path).ok()?).ok()?;
        if expired(stored.updated_at, self.ttl) {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        Some(stored.record)
    }

    pub fn remove(&self, job_id: &str) {
        self.entries.remove(job_id);
        if let Some(path) = self.file_for(job_id) {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Drops every expired record. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.updated_at.elapsed() < ttl);
        let mut removed = before.saturating_sub(self.entries.len());

        let Some(dir) = &self.dir else {
            return removed;
        };
        let Ok(listing) = std::fs::read_dir(dir.as_path()) else {
            return removed;
        };
        for entry in listing.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let stale = std::fs::read(&path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<StoredProgress>(&raw).ok())
                .is_none_or(|stored| expired(stored.updated_at, ttl));
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub fn reporter(&self, job_id: &str) -> ProgressReporter {
        ProgressReporter {
            tracker: self.clone(),
            job_id: job_id.to_string(),
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }
}

fn write_stored(path: &Path, record: &ProgressRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stored = StoredProgress {
        record: record.clone(),
        updated_at: Utc::now(),
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(&stored)?)?;
    std::fs::rename(&tmp, path)
}

/// Writes progress for one job. The reported percentage never goes down.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tracker: ProgressTracker,
    job_id: String,
    high_water: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Highest percentage reported so far.
    pub fn percentage(&self) -> u8 {
        self.high_water.load(Ordering::SeqCst)
    }

    pub fn update(&self, status: &str, percentage: u8, message: impl Into<String>) {
        self.publish(status, percentage, message.into(), None);
    }

    pub fn item(
        &self,
        status: &str,
        percentage: u8,
        message: impl Into<String>,
        current_item: impl Into<String>,
    ) {
        self.publish(status, percentage, message.into(), Some(current_item.into()));
    }

    fn publish(&self, status: &str, percentage: u8, message: String, current_item: Option<String>) {
        let pct = percentage.min(100);
        let previous = self.high_water.fetch_max(pct, Ordering::SeqCst);
        self.tracker.set(
            &self.job_id,
            ProgressRecord {
                status: status.to_string(),
                percentage: pct.max(previous),
                message,
                current_item,
            },
        );
    }
}

/// Linear position inside a progress band, e.g. 10..30 for the database stage.
pub fn band(start: u8, end: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return end;
    }
    let span = end.saturating_sub(start) as usize;
    let offset = (span * done.min(total)) / total;
    start.saturating_add(offset as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_never_moves_backwards() {
        let tracker = ProgressTracker::new();
        let reporter = tracker.reporter("backup_1");

        reporter.update("database", 25, "dumping");
        reporter.update("database", 12, "late update");

        let record = tracker.get("backup_1").expect("record present");
        assert_eq!(record.percentage, 25);
        assert_eq!(record.message, "late update");
    }

    #[test]
    fn test_expired_records_disappear() {
        let tracker = ProgressTracker::with_ttl(Duration::from_millis(0));
        tracker.reporter("restore_a").update("extracting", 20, "unpacking");
        assert!(tracker.get("restore_a").is_none());

        tracker.reporter("restore_b").update("extracting", 20, "unpacking");
        assert_eq!(tracker.sweep(), 1);
    }

    #[test]
    fn test_persistent_records_are_visible_to_another_tracker() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = ProgressTracker::persistent(dir.path(), PROGRESS_TTL);
        writer.reporter("backup_7").update("compressing", 72, "packing");

        let reader = ProgressTracker::persistent(dir.path(), PROGRESS_TTL);
        let record = reader.get("backup_7").ok_or_else(|| anyhow::anyhow!("not shared"))?;
        assert_eq!(record.status, "compressing");
        assert_eq!(record.percentage, 72);
        assert!(reader.get("../backup_7").is_none());

        writer.remove("backup_7");
        assert!(reader.get("backup_7").is_none());
        Ok(())
    }

    #[test]
    fn test_expired_files_are_swept() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let tracker = ProgressTracker::persistent(dir.path(), Duration::from_millis(0));
        tracker.reporter("restore_x").update("extracting", 20, "unpacking");
        assert!(dir.path().join("restore_x.json").exists());

        let other = ProgressTracker::persistent(dir.path(), Duration::from_millis(0));
        assert_eq!(other.sweep(), 1);
        assert!(!dir.path().join("restore_x.json").exists());
        Ok(())
    }

    #[test]
    fn test_band_interpolation() {
        assert_eq!(band(10, 30, 0, 4), 10);
        assert_eq!(band(10, 30, 2, 4), 20);
        assert_eq!(band(10, 30, 4, 4), 30);
        assert_eq!(band(30, 70, 9, 0), 70);
    }
}
