pub mod archive;
pub mod db_dump;
pub mod file_collector;
mod logic;
pub mod manifest;

pub use logic::{backup_job_id, delete_backup, run_backup, BackupOptions, BackupOutcome};
