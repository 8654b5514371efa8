use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::catalog::{Catalog, LogEntry, LogLevel};

/// Appends job-scoped entries to the catalog log and mirrors them to tracing.
#[derive(Debug, Clone)]
pub struct JobLogger {
    catalog: Arc<Catalog>,
    job: String,
}

impl JobLogger {
    pub fn new(catalog: Arc<Catalog>, job: impl Into<String>) -> Self {
        Self {
            catalog,
            job: job.into(),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into());
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => error!(job = %self.job, "{}", message),
            LogLevel::Warning => warn!(job = %self.job, "{}", message),
            _ => info!(job = %self.job, "{}", message),
        }
        let entry = LogEntry {
            job: self.job.clone(),
            level,
            message,
            created_at: Utc::now(),
        };
        if let Err(e) = self.catalog.append_log(entry) {
            warn!(job = %self.job, "Failed to persist log entry: {}", e);
        }
    }
}
