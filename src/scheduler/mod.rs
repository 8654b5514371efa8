//! Runs recurring backups whose time has come and enforces retention.
//!
//! The engine does not own a timer: a caller (cron, a systemd timer, the
//! `run-schedules` command) asks for due schedules to be run.

use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::backup::{backup_job_id, delete_backup, run_backup, BackupOptions};
use crate::catalog::{BackupType, Frequency, ScheduleDefinition};
use crate::utils::logger::JobLogger;
use crate::engine::EngineContext;
use crate::errors::Result;

/// A schedule still flagged running after this long is treated as crashed.
pub const STALE_SCHEDULE_AGE: Duration = Duration::hours(12);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleRun {
    pub schedule_id: u64,
    pub schedule_name: String,
    pub backup_id: Option<u64>,
    pub success: bool,
    pub message: String,
    pub next_run: DateTime<Utc>,
    pub retention_removed: usize,
}

pub fn next_run_after(frequency: Frequency, from: DateTime<Utc>) -> DateTime<Utc> {
    match frequency {
        Frequency::Hourly => from + Duration::hours(1),
        Frequency::TwiceDaily => from + Duration::hours(12),
        Frequency::Daily => from + Duration::days(1),
        Frequency::Weekly => from + Duration::weeks(1),
        Frequency::Monthly => from
            .checked_add_months(Months::new(1))
            .unwrap_or(from + Duration::days(30)),
    }
}

/// Job options for one run: the schedule's settings blob, then its own
/// type, destinations and incremental flag on top.
fn schedule_options(schedule: &ScheduleDefinition) -> BackupOptions {
    let mut merged = match serde_json::to_value(BackupOptions::default()) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    match &schedule.settings {
        Value::Object(settings) => {
            for (key, value) in settings {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        other => warn!(
            "Schedule {} settings are not an object and were ignored: {}",
            schedule.id, other
        ),
    }
    // `type` is accepted as an alias; drop it so it cannot clash.
    merged.remove("type");

    let mut options: BackupOptions = serde_json::from_value(Value::Object(merged)).unwrap_or_else(|e| {
        warn!("Schedule {} has invalid settings ({}); using defaults", schedule.id, e);
        BackupOptions::default()
    });
    options.backup_type = schedule.backup_type;
    if !schedule.destinations.is_empty() {
        options.destinations = schedule.destinations.clone();
    }
    options.incremental = schedule.incremental;
    options.incremental_parent = None;
    options
}

pub async fn run_due_schedules(ctx: &EngineContext) -> Vec<ScheduleRun> {
    run_due_schedules_at(ctx, Utc::now()).await
}

/// Runs every active, idle schedule due at `now`, one after another.
/// Schedules left running by a crashed process are released first, and
/// age-based local retention runs afterwards when configured.
pub async fn run_due_schedules_at(ctx: &EngineContext, now: DateTime<Utc>) -> Vec<ScheduleRun> {
    match ctx.catalog.release_stale_schedules(now - STALE_SCHEDULE_AGE) {
        Ok(released) if !released.is_empty() => {
            warn!("Released {} stale running schedule(s): {:?}", released.len(), released);
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to release stale schedules: {}", e),
    }

    let due = ctx.catalog.due_schedules(now);
    if !due.is_empty() {
        info!("{} schedule(s) due", due.len());
    }
    let mut runs = Vec::with_capacity(due.len());
    for schedule in due {
        runs.push(run_schedule(ctx, schedule, now).await);
    }

    if let Some(days) = ctx.config.local_retention_days {
        let cutoff = now - Duration::days(i64::from(days));
        if let Err(e) = prune_local_copies(ctx, cutoff).await {
            warn!("Local retention failed: {}", e);
        }
    }
    runs
}

async fn run_schedule(ctx: &EngineContext, schedule: ScheduleDefinition, now: DateTime<Utc>) -> ScheduleRun {
    let started = ctx.catalog.update_schedule(schedule.id, |s| {
        s.running = true;
        s.started_at = Some(Utc::now());
    });
    if let Err(e) = started {
        warn!("Failed to mark schedule {} running: {}", schedule.id, e);
    }

    let mut options = schedule_options(&schedule);
    if options.incremental {
        options.incremental_parent = ctx
            .catalog
            .latest_completed(schedule.backup_type)
            .map(|r| r.id);
        if options.incremental_parent.is_none() {
            options.incremental = false;
        }
    }
    info!(
        "Running schedule '{}' ({} {} backup)",
        schedule.name, schedule.frequency.as_str(), schedule.backup_type
    );
    let outcome = run_backup(ctx, options).await;

    let next_run = next_run_after(schedule.frequency, now);
    let advanced = ctx.catalog.update_schedule(schedule.id, |s| {
        s.last_run = Some(now);
        s.next_run = next_run;
        s.running = false;
        s.started_at = None;
    });
    if let Err(e) = advanced {
        warn!("Failed to advance schedule {}: {}", schedule.id, e);
    }

    // Runs whatever the outcome; a failed run adds nothing completed.
    let retention_removed = apply_retention(ctx, schedule.backup_type, schedule.retention_count)
        .await
        .unwrap_or_else(|e| {
            warn!("Retention for schedule {} failed: {}", schedule.id, e);
            0
        });

    ScheduleRun {
        schedule_id: schedule.id,
        schedule_name: schedule.name,
        backup_id: outcome.backup_id,
        success: outcome.success,
        message: outcome.message,
        next_run,
        retention_removed,
    }
}

/// Deletes completed backups of `backup_type` beyond the `keep` most recent.
/// `keep == 0` keeps everything.
pub async fn apply_retention(ctx: &EngineContext, backup_type: BackupType, keep: usize) -> Result<usize> {
    if keep == 0 {
        return Ok(0);
    }
    let mut removed = 0;
    for record in ctx.catalog.completed_of_type(backup_type).into_iter().skip(keep) {
        if delete_backup(ctx, record.id).await? {
            info!("Retention removed backup {} ({})", record.id, record.name);
            removed += 1;
        }
    }
    Ok(removed)
}

/// Whether `destination` is backed by the local filesystem.
fn is_local_destination(ctx: &EngineContext, destination: &str) -> bool {
    match ctx.config.storage.get(destination) {
        Some(settings) => settings.kind(destination) == "local",
        None => destination == "local",
    }
}

/// Drops the local copies of completed backups created before `cutoff`.
/// Records left with no location are removed; the rest keep their remote
/// copies. Returns how many local copies were deleted.
pub async fn prune_local_copies(ctx: &EngineContext, cutoff: DateTime<Utc>) -> Result<usize> {
    let mut removed = 0;
    let candidates = ctx
        .catalog
        .list_backups()
        .into_iter()
        .filter(|r| r.is_completed() && r.created_at < cutoff);
    for record in candidates {
        let local: Vec<(String, String)> = record
            .locations
            .iter()
            .filter(|(destination, _)| is_local_destination(ctx, destination))
            .map(|(d, l)| (d.clone(), l.clone()))
            .collect();
        if local.is_empty() {
            continue;
        }
        let logger = JobLogger::new(ctx.catalog.clone(), backup_job_id(record.id));
        for (destination, locator) in &local {
            let deleted = ctx.storage.get(destination)?.delete(locator).await;
            match deleted {
                Ok(_) => {
                    logger.info(format!("Local retention deleted {} from {}", locator, destination));
                    removed += 1;
                }
                Err(e) => {
                    logger.warning(format!("Failed to delete {} from {}: {:#}", locator, destination, e));
                }
            }
        }
        let remaining = ctx.catalog.update_backup(record.id, |r| {
            for (destination, _) in &local {
                r.locations.remove(destination);
            }
        })?;
        if remaining.locations.is_empty() {
            ctx.catalog.remove_backup(record.id)?;
            info!("Local retention removed backup {} ({})", record.id, record.name);
        }
    }
    ctx.catalog.prune_logs(cutoff)?;
    Ok(removed)
}
