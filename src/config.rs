//! Configuration for forgeflow, read from `.forgeflow/flow.toml`.
//!
//! Layering is file → environment (`FORGEFLOW_*`, `.env`) → CLI flags. Every
//! section is optional; a missing file yields the built-in defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//!
//! [database]
//! path = ".forgeflow/flow.db"
//!
//! [pipeline]
//! step_timeout_secs = 120
//! generation_timeout_secs = 600
//! max_retries = 2
//! retry_backoff_ms = 500
//!
//! [questions]
//! timeout_hours = 72
//! sweep_interval_secs = 60
//!
//! [features]
//! context_retrieval = true
//! labels = true
//! plan_approval = true
//! pull_requests = false
//!
//! [tracker]
//! base_url = "https://tracker.example.com/api"
//! bot_user_id = "forgeflow-bot"
//!
//! [generator]
//! command = "claude"
//!
//! [[statuses]]
//! name = "Needs Refinement"
//! phase = "refinement"
//! stage = "trigger"
//! cascade = true
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::status::{StatusEntry, StatusTable};

pub const DEFAULT_CONFIG_PATH: &str = ".forgeflow/flow.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".forgeflow/flow.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Step execution policy defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Timeout for quick steps (status writes, comments, labels)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Timeout for AI generation steps
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    /// Extra attempts after a transient failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles per attempt, capped at 30s
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_step_timeout() -> u64 {
    120
}

fn default_generation_timeout() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    500
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            generation_timeout_secs: default_generation_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl PipelineSection {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionsSection {
    #[serde(default = "default_question_timeout")]
    pub timeout_hours: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_question_timeout() -> u64 {
    72
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for QuestionsSection {
    fn default() -> Self {
        Self {
            timeout_hours: default_question_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl QuestionsSection {
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::hours(self.timeout_hours as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Optional steps a deployment can switch off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    ContextRetrieval,
    ContextDocuments,
    Labels,
    StoryApproval,
    PlanApproval,
    CodeApproval,
    PullRequests,
    StatusComments,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextRetrieval => "context_retrieval",
            Self::ContextDocuments => "context_documents",
            Self::Labels => "labels",
            Self::StoryApproval => "story_approval",
            Self::PlanApproval => "plan_approval",
            Self::CodeApproval => "code_approval",
            Self::PullRequests => "pull_requests",
            Self::StatusComments => "status_comments",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "enabled")]
    pub context_retrieval: bool,
    #[serde(default = "enabled")]
    pub context_documents: bool,
    #[serde(default = "enabled")]
    pub labels: bool,
    #[serde(default)]
    pub story_approval: bool,
    #[serde(default = "enabled")]
    pub plan_approval: bool,
    #[serde(default)]
    pub code_approval: bool,
    #[serde(default)]
    pub pull_requests: bool,
    #[serde(default = "enabled")]
    pub status_comments: bool,
}

fn enabled() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            context_retrieval: true,
            context_documents: true,
            labels: true,
            story_approval: false,
            plan_approval: true,
            code_approval: false,
            pull_requests: false,
            status_comments: true,
        }
    }
}

impl FeatureFlags {
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match feature {
            Feature::ContextRetrieval => self.context_retrieval,
            Feature::ContextDocuments => self.context_documents,
            Feature::Labels => self.labels,
            Feature::StoryApproval => self.story_approval,
            Feature::PlanApproval => self.plan_approval,
            Feature::CodeApproval => self.code_approval,
            Feature::PullRequests => self.pull_requests,
            Feature::StatusComments => self.status_comments,
        }
    }

    /// Everything off. Handy for tests that only want the mandatory steps.
    pub fn none() -> Self {
        Self {
            context_retrieval: false,
            context_documents: false,
            labels: false,
            story_approval: false,
            plan_approval: false,
            code_approval: false,
            pull_requests: false,
            status_comments: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerSection {
    /// Base URL of the tracker adapter. Unset runs in log-only mode.
    #[serde(default)]
    pub base_url: Option<String>,
    /// API token. Prefer `FORGEFLOW_TRACKER_TOKEN` over writing it here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Comments authored by this user are our own and never routed.
    #[serde(default)]
    pub bot_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSection {
    /// AI CLI command (default: "claude")
    #[serde(default = "default_generator_cmd")]
    pub command: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_generator_cmd() -> String {
    "claude".to_string()
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            command: default_generator_cmd(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsSection {
    #[serde(default = "default_documents_root")]
    pub root: PathBuf,
}

fn default_documents_root() -> PathBuf {
    PathBuf::from(".forgeflow/docs")
}

impl Default for DocumentsSection {
    fn default() -> Self {
        Self {
            root: default_documents_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceControlSection {
    /// Working copy that code-generation branches are cut from.
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_branch_prefix() -> String {
    "forgeflow".to_string()
}

impl Default for SourceControlSection {
    fn default() -> Self {
        Self {
            repo_path: default_repo_path(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

/// The complete flow.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub questions: QuestionsSection,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub documents: DocumentsSection,
    #[serde(default)]
    pub source_control: SourceControlSection,
    /// Ordered status table. Empty means the built-in default table.
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
}

impl FlowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flow.toml")
    }

    /// Load from `path`, or the defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize flow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay `FORGEFLOW_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("FORGEFLOW_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("FORGEFLOW_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid FORGEFLOW_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("FORGEFLOW_DB") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("FORGEFLOW_TRACKER_URL") {
            self.tracker.base_url = Some(url);
        }
        if let Some(token) = lookup("FORGEFLOW_TRACKER_TOKEN") {
            self.tracker.token = Some(token);
        }
        if let Some(bot) = lookup("FORGEFLOW_BOT_USER") {
            self.tracker.bot_user_id = Some(bot);
        }
        if let Some(cmd) = lookup("FORGEFLOW_GENERATOR_CMD") {
            self.generator.command = cmd;
        }
        if let Some(hours) = lookup("FORGEFLOW_QUESTION_TIMEOUT_HOURS") {
            self.questions.timeout_hours = hours
                .parse()
                .with_context(|| format!("Invalid FORGEFLOW_QUESTION_TIMEOUT_HOURS '{}'", hours))?;
        }
        Ok(())
    }

    /// Build the status table, falling back to the built-in lifecycle.
    pub fn status_table(&self) -> Result<StatusTable> {
        if self.statuses.is_empty() {
            Ok(StatusTable::default())
        } else {
            StatusTable::new(self.statuses.clone()).context("Invalid [[statuses]] table")
        }
    }

    /// Human-readable warnings about a configuration that will misbehave.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let mut seen = HashSet::new();
        for entry in &self.statuses {
            if !seen.insert(entry.name.trim().to_lowercase()) {
                warnings.push(format!("Duplicate status '{}'", entry.name));
            }
        }
        match self.status_table() {
            Ok(table) => warnings.extend(table.validate()),
            Err(e) => warnings.push(format!("{:#}", e)),
        }

        if self.pipeline.step_timeout_secs == 0 {
            warnings.push("pipeline.step_timeout_secs is 0; every step will time out".into());
        }
        if self.pipeline.generation_timeout_secs == 0 {
            warnings.push("pipeline.generation_timeout_secs is 0; generation will always time out".into());
        }
        if self.questions.timeout_hours == 0 {
            warnings.push("questions.timeout_hours is 0; questions expire immediately".into());
        }
        if self.tracker.base_url.is_none() {
            warnings.push("tracker.base_url is not set; comments and status updates are only logged".into());
        }
        warnings
    }
}

/// Starter config written by `forgeflow init`.
pub fn starter_config() -> FlowConfig {
    FlowConfig {
        statuses: crate::status::default_entries(),
        ..FlowConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{Phase, Stage};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FlowConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3142);
        assert_eq!(config.questions.timeout_hours, 72);
        assert!(config.features.plan_approval);
        assert!(!config.features.pull_requests);
        assert_eq!(config.status_table().unwrap().len(), 18);
    }

    #[test]
    fn test_parse_sections_and_statuses() {
        let config = FlowConfig::parse(
            r#"
            [pipeline]
            max_retries = 5

            [features]
            labels = false

            [[statuses]]
            name = "Todo"

            [[statuses]]
            name = "Refine"
            phase = "refinement"
            stage = "trigger"
            cascade = true
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.max_retries, 5);
        assert_eq!(config.pipeline.retry_backoff_ms, 500);
        assert!(!config.features.is_enabled(Feature::Labels));
        assert!(config.features.is_enabled(Feature::ContextRetrieval));

        let table = config.status_table().unwrap();
        assert_eq!(table.len(), 2);
        let refine = table.get("refine").unwrap();
        assert_eq!(refine.phase, Some(Phase::Refinement));
        assert_eq!(refine.stage, Stage::Trigger);
        assert!(refine.cascade);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FORGEFLOW_PORT", "9000"),
            ("FORGEFLOW_TRACKER_TOKEN", "secret"),
            ("FORGEFLOW_QUESTION_TIMEOUT_HOURS", "4"),
        ]);
        let mut config = FlowConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.tracker.token.as_deref(), Some("secret"));
        assert_eq!(config.questions.timeout_hours, 4);
    }

    #[test]
    fn test_invalid_env_port_is_an_error() {
        let mut config = FlowConfig::default();
        let result = config.apply_overrides(|k| (k == "FORGEFLOW_PORT").then(|| "abc".to_string()));
        assert!(result.unwrap_err().to_string().contains("FORGEFLOW_PORT"));
    }

    #[test]
    fn test_validate_flags_duplicates_and_zero_timeouts() {
        let mut config = FlowConfig::default();
        config.statuses = vec![
            StatusEntry::new("Todo", None, Stage::Idle),
            StatusEntry::new("TODO", None, Stage::Idle),
        ];
        config.questions.timeout_hours = 0;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("Duplicate status")));
        assert!(warnings.iter().any(|w| w.contains("timeout_hours is 0")));
    }

    #[test]
    fn test_save_and_load_starter_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".forgeflow/flow.toml");
        starter_config().save(&path).unwrap();

        let loaded = FlowConfig::load(&path).unwrap();
        assert_eq!(loaded.statuses.len(), 18);
        assert!(loaded.status_table().unwrap().validate().is_empty());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = FlowConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.generator.command, "claude");
    }
}
