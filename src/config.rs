//! Configuration loader and validator for the revision tracker.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::diff::DiffOptions;
use crate::model::Platform;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub drive: Drive,
    #[serde(default)]
    pub notion: Notion,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_diff_bytes")]
    pub max_diff_bytes: usize,
}

fn default_max_diff_bytes() -> usize {
    crate::diff::DEFAULT_MAX_DIFF_BYTES
}

/// Google Drive settings. The access token is obtained out of band.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Drive {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub documents: Vec<Target>,
}

/// Notion API settings and tracked pages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notion {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_notion_version")]
    pub version: String,
    #[serde(default)]
    pub pages: Vec<Target>,
}

impl Default for Notion {
    fn default() -> Self {
        Self {
            token: String::new(),
            version: default_notion_version(),
            pages: Vec::new(),
        }
    }
}

fn default_notion_version() -> String {
    "2022-06-28".to_string()
}

/// A tracked Drive document or Notion page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise a database file inside the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/revtrack.db", self.app.resolved_data_dir()))
    }

    /// Every tracked document, Drive first, in config order.
    pub fn targets(&self) -> Vec<(Platform, String)> {
        let drive = self
            .drive
            .documents
            .iter()
            .map(|t| (Platform::GoogleDrive, t.id.trim().to_string()));
        let notion = self
            .notion
            .pages
            .iter()
            .map(|t| (Platform::Notion, t.id.trim().to_string()));
        drive.chain(notion).collect()
    }

    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            max_bytes: self.app.max_diff_bytes,
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_diff_bytes == 0 {
        return Err(ConfigError::Invalid("app.max_diff_bytes must be > 0"));
    }

    if cfg.drive.documents.is_empty() && cfg.notion.pages.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one drive.documents or notion.pages entry is required",
        ));
    }

    if !cfg.drive.documents.is_empty() && cfg.drive.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("drive.access_token must be non-empty"));
    }
    if !targets_are_valid(&cfg.drive.documents) {
        return Err(ConfigError::Invalid(
            "drive.documents ids must be non-empty and unique",
        ));
    }

    if !cfg.notion.pages.is_empty() {
        if cfg.notion.token.trim().is_empty() {
            return Err(ConfigError::Invalid("notion.token must be non-empty"));
        }
        if cfg.notion.version.trim().is_empty() {
            return Err(ConfigError::Invalid("notion.version must be non-empty"));
        }
    }
    if !targets_are_valid(&cfg.notion.pages) {
        return Err(ConfigError::Invalid(
            "notion.pages ids must be non-empty and unique",
        ));
    }

    Ok(())
}

fn targets_are_valid(targets: &[Target]) -> bool {
    let mut seen = HashSet::new();
    targets
        .iter()
        .all(|t| !t.id.trim().is_empty() && seen.insert(t.id.trim()))
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000
  max_diff_bytes: 1048576

drive:
  access_token: "YOUR_GOOGLE_OAUTH_ACCESS_TOKEN"
  documents:
    - id: "GOOGLE_DOC_FILE_ID"
      title: "Design notes"

notion:
  token: "YOUR_NOTION_INTEGRATION_TOKEN"
  version: "2022-06-28"
  pages:
    - id: "NOTION_PAGE_ID"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.drive.documents[0].title.as_deref(), Some("Design notes"));
        assert_eq!(cfg.diff_options().max_bytes, 1048576);
        assert_eq!(
            cfg.targets(),
            vec![
                (Platform::GoogleDrive, "GOOGLE_DOC_FILE_ID".to_string()),
                (Platform::Notion, "NOTION_PAGE_ID".to_string()),
            ]
        );
    }

    #[test]
    fn platform_sections_are_optional() {
        let cfg: Config = serde_yaml::from_str(
            r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
notion:
  token: "t"
  pages:
    - id: "p1"
"#,
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert!(cfg.drive.documents.is_empty());
        assert_eq!(cfg.notion.version, "2022-06-28");
        assert_eq!(cfg.app.max_diff_bytes, crate::diff::DEFAULT_MAX_DIFF_BYTES);
    }

    #[test]
    fn requires_some_target() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.drive.documents.clear();
        cfg.notion.pages.clear();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("at least one")), _ => panic!("wrong error") }
    }

    #[test]
    fn missing_tokens_rejected_only_when_targets_exist() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.drive.access_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("drive.access_token")), _ => panic!("wrong error") }

        cfg.drive.documents.clear();
        validate(&cfg).unwrap();

        cfg.notion.token = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("notion.token")), _ => panic!("wrong error") }
    }

    #[test]
    fn duplicate_target_ids_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        let dup = cfg.notion.pages[0].clone();
        cfg.notion.pages.push(dup);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.drive.documents[0].id = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_limits_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.max_diff_bytes = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.notion.pages[0].id, "NOTION_PAGE_ID");
    }
}
