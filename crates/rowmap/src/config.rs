//! Configuration for a [`Db`](crate::Db).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rowmap_core::{ConfigError, LabelRegistry, PlaceholderStyle};

/// Settings applied when a `Db` wraps a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Overrides the placeholder style reported by the driver.
    pub placeholder: Option<PlaceholderStyle>,
    /// Check that the table exists when a table is opened or bound.
    pub check_table_existence: bool,
    /// Application tag labels accepted in addition to the built-in set.
    pub custom_labels: Vec<String>,
    /// Cached statements idle longer than this are closed by `Db::sweep`.
    pub statement_idle_ttl: Option<Duration>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            placeholder: None,
            check_table_existence: true,
            custom_labels: Vec::new(),
            statement_idle_ttl: None,
        }
    }
}

impl DbConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placeholder(mut self, style: PlaceholderStyle) -> Self {
        self.placeholder = Some(style);
        self
    }

    pub fn check_table_existence(mut self, check: bool) -> Self {
        self.check_table_existence = check;
        self
    }

    pub fn custom_label(mut self, label: impl Into<String>) -> Self {
        self.custom_labels.push(label.into());
        self
    }

    pub fn statement_idle_ttl(mut self, ttl: Duration) -> Self {
        self.statement_idle_ttl = Some(ttl);
        self
    }

    pub fn label_registry(&self) -> Result<LabelRegistry, ConfigError> {
        LabelRegistry::with_labels(&self.custom_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert!(config.check_table_existence);
        assert!(config.placeholder.is_none());
        assert!(config.label_registry().unwrap().resolve("perms").is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: DbConfig = serde_json::from_str(
            r#"{"custom_labels": ["perms"], "placeholder": "question_mark"}"#,
        )
        .unwrap();
        assert!(config.check_table_existence);
        assert_eq!(config.placeholder, Some(PlaceholderStyle::QuestionMark));
        assert!(config.label_registry().unwrap().resolve("perms").is_some());
    }

    #[test]
    fn test_builder() {
        let config = DbConfig::new()
            .check_table_existence(false)
            .custom_label("audit")
            .statement_idle_ttl(Duration::from_secs(30));
        assert!(!config.check_table_existence);
        assert_eq!(config.statement_idle_ttl, Some(Duration::from_secs(30)));
    }
}
