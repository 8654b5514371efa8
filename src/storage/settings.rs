use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat key/value settings for one storage destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendSettings(Map<String, Value>);

impl BackendSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Backend kind, taken from `type` or falling back to the destination name.
    pub fn kind(&self, destination: &str) -> String {
        self.get_str("type")
            .unwrap_or(destination)
            .to_ascii_lowercase()
    }

    /// Non-empty string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .with_context(|| format!("missing required setting '{}'", key))
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_u64().map(|v| v != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Trimmed directory-style setting without leading or trailing slashes.
    pub fn get_dir(&self, key: &str) -> Option<String> {
        self.get_str(key)
            .map(|s| s.trim().trim_matches('/').to_string())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accessors_accept_loose_types() -> anyhow::Result<()> {
        let settings: BackendSettings = serde_json::from_value(json!({
            "type": "S3",
            "port": "2121",
            "passive": "no",
            "chunk_size": 4096,
            "folder": "/backups/site/",
            "empty": "  "
        }))?;

        assert_eq!(settings.kind("offsite"), "s3");
        assert_eq!(settings.get_u64("port"), Some(2121));
        assert_eq!(settings.get_u64("chunk_size"), Some(4096));
        assert_eq!(settings.get_bool("passive"), Some(false));
        assert_eq!(settings.get_dir("folder").as_deref(), Some("backups/site"));
        assert_eq!(settings.get_str("empty"), None);
        assert!(settings.require_str("bucket").is_err());
        Ok(())
    }
}
