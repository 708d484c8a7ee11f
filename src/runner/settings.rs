use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::behavior::SuccessFallback;

/// Limit and concurrency knobs of one runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Dispatch records per primary group
    pub optimize: bool,
    /// Worker budget; parallel variants fall back to their own default
    pub max_workers: Option<usize>,
    /// Stop once this many success records exist
    pub max_success_records: Option<usize>,
    /// Stop trying new primary values once this many have a success
    pub max_success_primary_items: Option<usize>,
    /// Success records allowed per primary value
    pub max_primary_success_records: Option<usize>,
    /// Primary groups running at the same time
    pub max_multiple_primary_items: Option<usize>,
    pub excluded_primary_items: Vec<Value>,
    /// Overrides the behavior's own success fallback
    pub success_fallback: Option<SuccessFallback>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            optimize: true,
            max_workers: None,
            max_success_records: None,
            max_success_primary_items: None,
            max_primary_success_records: None,
            max_multiple_primary_items: None,
            excluded_primary_items: Vec::new(),
            success_fallback: None,
        }
    }
}

impl RunSettings {
    /// Load the `runner` section of `broote.json` in `dir`, or defaults
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("broote.json");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .context("Failed to read broote.json")?;
            let config: Value =
                serde_json::from_str(&content).context("Failed to parse broote.json")?;

            if let Some(runner) = config.get("runner") {
                return serde_json::from_value(runner.clone())
                    .context("Failed to parse runner settings");
            }
        }
        Ok(Self::default())
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_max_workers(mut self, total: usize) -> Self {
        self.max_workers = Some(total);
        self
    }

    pub fn with_max_success_records(mut self, total: usize) -> Self {
        self.max_success_records = Some(total);
        self
    }

    pub fn with_max_success_primary_items(mut self, total: usize) -> Self {
        self.max_success_primary_items = Some(total);
        self
    }

    pub fn with_max_primary_success_records(mut self, total: usize) -> Self {
        self.max_primary_success_records = Some(total);
        self
    }

    pub fn with_max_multiple_primary_items(mut self, total: usize) -> Self {
        self.max_multiple_primary_items = Some(total);
        self
    }

    pub fn with_success_fallback(mut self, fallback: SuccessFallback) -> Self {
        self.success_fallback = Some(fallback);
        self
    }

    pub fn with_excluded_primary_items<I, V>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.excluded_primary_items
            .extend(items.into_iter().map(Into::into));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = RunSettings::default();
        assert!(settings.optimize);
        assert!(settings.max_workers.is_none());
        assert!(settings.excluded_primary_items.is_empty());
    }

    #[test]
    fn test_load_returns_default_when_no_config() {
        let temp_dir = TempDir::new().unwrap();
        let settings = RunSettings::load(temp_dir.path()).unwrap();
        assert_eq!(settings, RunSettings::default());
    }

    #[test]
    fn test_load_from_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_json = r#"{
            "runner": {
                "optimize": false,
                "max_workers": 4,
                "max_success_records": 1,
                "excluded_primary_items": ["John"],
                "success_fallback": "conservative"
            }
        }"#;
        std::fs::write(temp_dir.path().join("broote.json"), config_json).unwrap();

        let settings = RunSettings::load(temp_dir.path()).unwrap();
        assert!(!settings.optimize);
        assert_eq!(settings.max_workers, Some(4));
        assert_eq!(settings.max_success_records, Some(1));
        assert_eq!(settings.excluded_primary_items, vec![json!("John")]);
        assert!(settings.max_multiple_primary_items.is_none());
        assert_eq!(settings.success_fallback, Some(SuccessFallback::Conservative));
    }

    #[test]
    fn test_load_rejects_malformed_section() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("broote.json"),
            r#"{"runner": {"max_workers": "many"}}"#,
        )
        .unwrap();
        assert!(RunSettings::load(temp_dir.path()).is_err());
    }

    #[test]
    fn test_builders() {
        let settings = RunSettings::default()
            .with_optimize(false)
            .with_max_workers(3)
            .with_max_primary_success_records(2)
            .with_excluded_primary_items(["Ben", "Marry"]);
        assert!(!settings.optimize);
        assert_eq!(settings.max_workers, Some(3));
        assert_eq!(settings.max_primary_success_records, Some(2));
        assert_eq!(settings.excluded_primary_items.len(), 2);
    }
}
