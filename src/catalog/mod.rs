//! Persistent record of backups, schedules and job logs.

pub mod models;
pub mod store;

pub use models::{
    BackupRecord, BackupStatus, BackupType, Frequency, LogEntry, LogLevel, ScheduleDefinition,
};
pub use store::Catalog;
