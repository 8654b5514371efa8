use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    #[default]
    Full,
    Database,
    Files,
}

impl BackupType {
    pub fn includes_database(self) -> bool {
        matches!(self, BackupType::Full | BackupType::Database)
    }

    pub fn includes_files(self) -> bool {
        matches!(self, BackupType::Full | BackupType::Files)
    }

    /// Only types with a file tree can diff against a parent.
    pub fn allows_incremental(self) -> bool {
        self.includes_files()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Database => "database",
            BackupType::Files => "files",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "database" | "db" => Ok(BackupType::Database),
            "files" => Ok(BackupType::Files),
            other => Err(format!("unknown backup type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: u64,
    pub name: String,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub size: u64,
    /// destination name -> backend locator
    pub locations: BTreeMap<String, String>,
    pub incremental_parent: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl BackupRecord {
    pub fn new(name: impl Into<String>, backup_type: BackupType) -> Self {
        Self {
            id: 0,
            name: name.into(),
            backup_type,
            status: BackupStatus::Pending,
            size: 0,
            locations: BTreeMap::new(),
            incremental_parent: None,
            created_at: Utc::now(),
            completed_at: None,
            metadata: serde_json::Value::Null,
            error: None,
        }
    }

    pub fn archive_file_name(&self) -> String {
        format!("{}.tar.gz", self.name)
    }

    pub fn is_completed(&self) -> bool {
        self.status == BackupStatus::Completed
    }
}

/// Recurrence of a schedule. Unrecognised values read as daily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum Frequency {
    Hourly,
    TwiceDaily,
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Frequency::Hourly,
            "twice_daily" | "twicedaily" => Frequency::TwiceDaily,
            "weekly" => Frequency::Weekly,
            "monthly" => Frequency::Monthly,
            _ => Frequency::Daily,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::TwiceDaily => "twice_daily",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl From<String> for Frequency {
    fn from(value: String) -> Self {
        Frequency::parse(&value)
    }
}

impl From<Frequency> for String {
    fn from(value: Frequency) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: u64,
    pub name: String,
    pub backup_type: BackupType,
    pub frequency: Frequency,
    pub destinations: Vec<String>,
    pub retention_count: usize,
    pub incremental: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub active: bool,
    /// Advisory only; two engines may still race on the same schedule.
    #[serde(default)]
    pub running: bool,
    /// When the current run began; lets a crashed run be recognized.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl ScheduleDefinition {
    pub fn new(name: impl Into<String>, backup_type: BackupType, frequency: Frequency) -> Self {
        Self {
            id: 0,
            name: name.into(),
            backup_type,
            frequency,
            destinations: vec!["local".to_string()],
            retention_count: 5,
            incremental: false,
            next_run: Utc::now(),
            last_run: None,
            active: true,
            running: false,
            started_at: None,
            settings: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_frequency_reads_as_daily() -> anyhow::Result<()> {
        let parsed: Frequency = serde_json::from_value(serde_json::json!("fortnightly"))?;
        assert_eq!(parsed, Frequency::Daily);
        let parsed: Frequency = serde_json::from_value(serde_json::json!("twice_daily"))?;
        assert_eq!(parsed, Frequency::TwiceDaily);
        assert_eq!(serde_json::to_value(Frequency::Monthly)?, serde_json::json!("monthly"));
        Ok(())
    }

    #[test]
    fn test_backup_type_capabilities() {
        assert!(BackupType::Full.allows_incremental());
        assert!(BackupType::Files.allows_incremental());
        assert!(!BackupType::Database.allows_incremental());
        assert!(!BackupType::Files.includes_database());
        assert_eq!("DB".parse::<BackupType>(), Ok(BackupType::Database));
        assert!("weekly".parse::<BackupType>().is_err());
    }
}
