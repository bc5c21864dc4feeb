//! Narrow interfaces to the systems the orchestrator drives but does not own.
//!
//! | Trait | Adapter | Purpose |
//! |-------|---------|---------|
//! | `IssueTracker` | `HttpTracker`, `LogTracker` | comments, status, labels, descriptions |
//! | `Generator` | `CliGenerator` | AI generation for every phase |
//! | `ContextRetriever` | `NullRetriever` | code/document context for prompts |
//! | `DocumentStore` | `FsDocumentStore` | phase artefacts |
//! | `SourceControl` | `GhSourceControl` | branches and pull requests |

mod documents;
mod generator;
mod source_control;
mod tracker;

pub use documents::FsDocumentStore;
pub use generator::{CliGenerator, build_prompt, extract_json};
pub use source_control::{GhSourceControl, slugify};
pub use tracker::{HttpTracker, LogTracker};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::FlowConfig;
use crate::models::WorkItem;
use crate::status::Phase;

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Post a comment, optionally as a reply. Returns the new comment id.
    async fn post_comment(
        &self,
        item_id: &str,
        body: &str,
        parent_comment_id: Option<&str>,
    ) -> Result<String>;

    async fn update_status(&self, item_id: &str, status: &str) -> Result<()>;

    async fn add_labels(&self, item_id: &str, labels: &[String]) -> Result<()>;

    async fn update_description(&self, item_id: &str, description: &str) -> Result<()>;
}

/// What a generation call is for. Each task has its own prompt and output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationTask {
    RefinementAnalysis,
    RefinedDescription,
    UserStories,
    SolutionOptions,
    TechnicalPlan,
    CodeChanges,
}

impl GenerationTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefinementAnalysis => "refinement_analysis",
            Self::RefinedDescription => "refined_description",
            Self::UserStories => "user_stories",
            Self::SolutionOptions => "solution_options",
            Self::TechnicalPlan => "technical_plan",
            Self::CodeChanges => "code_changes",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub task: GenerationTask,
    pub item: WorkItem,
    /// Prior step outputs selected by the step's input transform.
    pub input: Value,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Run one generation and return its JSON output.
    async fn generate(&self, request: &GenerationRequest) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub source: String,
    pub content: String,
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, item: &WorkItem, phase: Phase) -> Result<Vec<ContextSnippet>>;
}

/// Retriever for deployments without an index: always returns nothing.
pub struct NullRetriever;

#[async_trait]
impl ContextRetriever for NullRetriever {
    async fn retrieve(&self, _item: &WorkItem, _phase: Phase) -> Result<Vec<ContextSnippet>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Refinement,
    UserStories,
    TechnicalPlan,
    CodeChanges,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refinement => "refinement",
            Self::UserStories => "user-stories",
            Self::TechnicalPlan => "technical-plan",
            Self::CodeChanges => "code-changes",
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a phase artefact. Returns where it was written.
    async fn save(&self, item: &WorkItem, kind: DocumentKind, content: &str) -> Result<String>;
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Publish generated changes for review. Returns the pull request URL.
    async fn open_pull_request(&self, item: &WorkItem, changes: &Value) -> Result<String>;
}

/// Every external collaborator, shared by all runs.
#[derive(Clone)]
pub struct Collaborators {
    pub tracker: Arc<dyn IssueTracker>,
    pub generator: Arc<dyn Generator>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub documents: Arc<dyn DocumentStore>,
    pub source_control: Arc<dyn SourceControl>,
}

impl Collaborators {
    /// Build the production adapters described by the configuration.
    pub fn from_config(config: &FlowConfig) -> Result<Self> {
        let tracker: Arc<dyn IssueTracker> = match &config.tracker.base_url {
            Some(url) => Arc::new(HttpTracker::new(url, config.tracker.token.clone())?),
            None => Arc::new(LogTracker),
        };
        Ok(Self {
            tracker,
            generator: Arc::new(CliGenerator::new(
                &config.generator.command,
                config.generator.model.clone(),
                &config.source_control.repo_path,
            )),
            retriever: Arc::new(NullRetriever),
            documents: Arc::new(FsDocumentStore::new(&config.documents.root)),
            source_control: Arc::new(GhSourceControl::new(
                &config.source_control.repo_path,
                &config.source_control.branch_prefix,
            )),
        })
    }
}
