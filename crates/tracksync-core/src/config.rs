//! Configuration (`config.yaml`).
//!
//! Loaded once per run and validated before any remote call: a run under a
//! bad configuration risks duplicate creation, so every problem here is a
//! fatal `SyncError::Configuration`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;
use crate::domain::SyncError;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// What to do with a remote issue that has no matching local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanBehavior {
    /// Create a local record for it.
    Pull,
    #[default]
    Ignore,
    /// Close it on the remote.
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub repo_owner: String,
    pub repo_name: String,
    /// Board (GitHub Projects v2 number). No board operations when both this
    /// and `project_name` are absent.
    #[serde(default)]
    pub project_number: Option<u64>,
    /// Board title. Used when `project_number` is absent: the board is looked
    /// up by title and created on the first board operation.
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default = "default_tracker_file")]
    pub tracker_file: PathBuf,
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: PathBuf,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    /// Workflow stages, in file order.
    pub sections: Vec<String>,
    /// Section given to pulled orphans. Defaults to the first section.
    #[serde(default)]
    pub default_section: Option<String>,
    /// Sections that are never synchronised.
    #[serde(default = "default_local_only_sections")]
    pub local_only_sections: Vec<String>,
    /// Section name → board column name.
    #[serde(default)]
    pub section_columns: BTreeMap<String, String>,
    #[serde(default)]
    pub orphan_behavior: OrphanBehavior,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_tracker_file() -> PathBuf {
    PathBuf::from("tracker.md")
}

fn default_snapshot_file() -> PathBuf {
    PathBuf::from(".tracksync/snapshot.json")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from(".tracksync.lock")
}

fn default_local_only_sections() -> Vec<String> {
    vec!["IDEAS".to_string()]
}

fn default_concurrency() -> usize {
    4
}

impl Config {
    /// Minimal valid configuration, mostly for tests and embedding.
    pub fn new(repo_owner: &str, repo_name: &str, sections: &[&str]) -> Self {
        Self {
            repo_owner: repo_owner.to_string(),
            repo_name: repo_name.to_string(),
            project_number: None,
            project_name: None,
            tracker_file: default_tracker_file(),
            snapshot_file: default_snapshot_file(),
            lock_file: default_lock_file(),
            sections: sections.iter().map(|s| s.to_string()).collect(),
            default_section: None,
            local_only_sections: default_local_only_sections(),
            section_columns: BTreeMap::new(),
            orphan_behavior: OrphanBehavior::default(),
            concurrency: default_concurrency(),
            retry: RetrySettings::default(),
        }
    }

    /// Read, resolve relative paths against the config file's directory, validate.
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let text = fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        let mut config = Self::from_yaml_str(&text)?;
        if let Some(dir) = path.parent() {
            config.rebase_paths(dir);
        }
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SyncError> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| SyncError::config("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn rebase_paths(&mut self, dir: &Path) {
        for path in [&mut self.tracker_file, &mut self.snapshot_file, &mut self.lock_file] {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.repo_owner.trim().is_empty() {
            return Err(SyncError::config("repo_owner", "must not be empty"));
        }
        if self.repo_name.trim().is_empty() {
            return Err(SyncError::config("repo_name", "must not be empty"));
        }
        if self.sections.is_empty() {
            return Err(SyncError::config("sections", "at least one section is required"));
        }
        let mut seen = BTreeSet::new();
        for section in &self.sections {
            if !seen.insert(section.as_str()) {
                return Err(SyncError::config("sections", format!("`{section}` is listed twice")));
            }
        }
        if let Some(default) = &self.default_section
            && !self.sections.contains(default)
        {
            return Err(SyncError::config(
                "default_section",
                format!("`{default}` is not one of the configured sections"),
            ));
        }
        let mut columns = BTreeMap::new();
        for (section, column) in &self.section_columns {
            if !self.sections.contains(section) {
                return Err(SyncError::config(
                    "section_columns",
                    format!("`{section}` is not one of the configured sections"),
                ));
            }
            if let Some(other) = columns.insert(column.as_str(), section.as_str()) {
                return Err(SyncError::config(
                    "section_columns",
                    format!("column `{column}` is mapped from both `{other}` and `{section}`"),
                ));
            }
        }
        if self.concurrency == 0 {
            return Err(SyncError::config("concurrency", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::config("retry.max_attempts", "must be at least 1"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(SyncError::config(
                "retry.multiplier",
                format!("must be a finite number >= 1, got {}", self.retry.multiplier),
            ));
        }
        if let Some(name) = &self.project_name
            && name.trim().is_empty()
        {
            return Err(SyncError::config("project_name", "must not be empty"));
        }
        Ok(())
    }

    pub fn default_section(&self) -> &str {
        self.default_section
            .as_deref()
            .or_else(|| self.sections.first().map(String::as_str))
            .unwrap_or_default()
    }

    pub fn board_enabled(&self) -> bool {
        self.project_number.is_some() || self.project_name.is_some()
    }

    pub fn is_local_only(&self, section: &str) -> bool {
        self.local_only_sections.iter().any(|s| s == section)
    }

    /// Sections a record may legally carry.
    pub fn is_known_section(&self, section: &str) -> bool {
        self.sections.iter().any(|s| s == section) || self.is_local_only(section)
    }

    pub fn columns(&self) -> SectionColumns {
        SectionColumns::new(&self.section_columns)
    }
}

/// Section ↔ column mapping. A pure function of configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionColumns {
    forward: BTreeMap<String, String>,
    reverse: BTreeMap<String, String>,
}

impl SectionColumns {
    pub fn new(mapping: &BTreeMap<String, String>) -> Self {
        let reverse = mapping
            .iter()
            .map(|(section, column)| (column.clone(), section.clone()))
            .collect();
        Self {
            forward: mapping.clone(),
            reverse,
        }
    }

    pub fn column_for(&self, section: &str) -> Option<&str> {
        self.forward.get(section).map(String::as_str)
    }

    pub fn section_for(&self, column: &str) -> Option<&str> {
        self.reverse.get(column).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SAMPLE: &str = r#"
repo_owner: octo
repo_name: tracker
project_number: 3
sections: [TODO, DOING, DONE]
section_columns:
  TODO: Todo
  DOING: In Progress
  DONE: Done
orphan_behavior: pull
retry:
  max_attempts: 2
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.orphan_behavior, OrphanBehavior::Pull);
        assert_eq!(config.default_section(), "TODO");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert!(config.board_enabled());
        assert!(config.is_local_only("IDEAS"));
        assert!(config.is_known_section("IDEAS"));

        let columns = config.columns();
        assert_eq!(columns.column_for("DOING"), Some("In Progress"));
        assert_eq!(columns.section_for("Done"), Some("DONE"));
        assert_eq!(columns.section_for("Backlog"), None);
    }

    #[test]
    fn project_name_alone_enables_the_board() {
        let config =
            Config::from_yaml_str("repo_owner: o\nrepo_name: r\nsections: [A]\nproject_name: Roadmap")
                .unwrap();
        assert_eq!(config.project_number, None);
        assert!(config.board_enabled());
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let mut config = Config::from_yaml_str(SAMPLE).unwrap();
        config.rebase_paths(Path::new("/work/repo"));
        assert_eq!(config.tracker_file, PathBuf::from("/work/repo/tracker.md"));
        assert_eq!(
            config.snapshot_file,
            PathBuf::from("/work/repo/.tracksync/snapshot.json")
        );
    }

    #[rstest]
    #[case("repo_owner: ''\nrepo_name: r\nsections: [A]", "repo_owner")]
    #[case("repo_owner: o\nrepo_name: r\nsections: []", "sections")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A, A]", "sections")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\ndefault_section: B", "default_section")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\nsection_columns: {B: Col}", "section_columns")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A, B]\nsection_columns: {A: Col, B: Col}", "section_columns")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\nconcurrency: 0", "concurrency")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\norphan_behavior: adopt", "config")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\nretry: {max_attempts: 0}", "retry.max_attempts")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\nretry: {multiplier: -1.0}", "retry.multiplier")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\nretry: {multiplier: 0.5}", "retry.multiplier")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\nretry: {multiplier: .nan}", "retry.multiplier")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\nretry: {multiplier: .inf}", "retry.multiplier")]
    #[case("repo_owner: o\nrepo_name: r\nsections: [A]\nproject_name: ' '", "project_name")]
    fn invalid_configs_are_rejected(#[case] yaml: &str, #[case] field: &str) {
        match Config::from_yaml_str(yaml) {
            Err(SyncError::Configuration { field: got, .. }) => assert_eq!(got, field),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }
}
