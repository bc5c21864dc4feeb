//! In-memory collaborators and a wired-up engine for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::collab::{
    Collaborators, DocumentKind, DocumentStore, GenerationRequest, GenerationTask, Generator, IssueTracker,
    NullRetriever, SourceControl,
};
use crate::config::{FeatureFlags, FlowConfig};
use crate::db::DbHandle;
use crate::engine::Engine;
use crate::models::{ItemUpsert, RunRecord, RunState, WorkItem};
use crate::pipeline::{Services, StepExecutor};
use crate::router::TriggerRouter;
use crate::runtime::Runtime;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

pub const BOT_USER: &str = "forgeflow-bot";

pub fn work_item(id: &str, status: &str, parent: Option<&str>) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        identifier: id.to_uppercase(),
        status: status.to_string(),
        parent_id: parent.map(String::from),
        team_id: Some("team-1".to_string()),
        title: format!("Item {}", id),
        description: format!("Description of {}", id),
        updated_at: Utc::now(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedComment {
    pub id: String,
    pub item_id: String,
    pub body: String,
    pub parent: Option<String>,
}

/// Tracker that records every call. Status updates and comments can be
/// switched to fail like an unavailable tracker.
#[derive(Default)]
pub struct MockTracker {
    comments: Mutex<Vec<PostedComment>>,
    statuses: Mutex<Vec<(String, String)>>,
    labels: Mutex<Vec<(String, Vec<String>)>>,
    descriptions: Mutex<Vec<(String, String)>>,
    status_down: AtomicBool,
    comments_down: AtomicBool,
}

impl MockTracker {
    pub fn fail_status_updates(&self, fail: bool) {
        self.status_down.store(fail, Ordering::SeqCst);
    }

    pub fn fail_comments(&self, fail: bool) {
        self.comments_down.store(fail, Ordering::SeqCst);
    }

    pub fn comments_for(&self, item_id: &str) -> Vec<PostedComment> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.item_id == item_id)
            .cloned()
            .collect()
    }

    pub fn statuses_for(&self, item_id: &str) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == item_id)
            .map(|(_, status)| status.clone())
            .collect()
    }

    pub fn labels_for(&self, item_id: &str) -> Vec<String> {
        self.labels
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == item_id)
            .flat_map(|(_, labels)| labels.clone())
            .collect()
    }

    pub fn description_of(&self, item_id: &str) -> Option<String> {
        self.descriptions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == item_id)
            .map(|(_, d)| d.clone())
    }
}

#[async_trait]
impl IssueTracker for MockTracker {
    async fn post_comment(&self, item_id: &str, body: &str, parent: Option<&str>) -> Result<String> {
        if self.comments_down.load(Ordering::SeqCst) {
            bail!("tracker 503");
        }
        let mut comments = self.comments.lock().unwrap();
        let id = format!("c-{}", comments.len() + 1);
        comments.push(PostedComment {
            id: id.clone(),
            item_id: item_id.to_string(),
            body: body.to_string(),
            parent: parent.map(String::from),
        });
        Ok(id)
    }

    async fn update_status(&self, item_id: &str, status: &str) -> Result<()> {
        if self.status_down.load(Ordering::SeqCst) {
            bail!("tracker 503");
        }
        self.statuses
            .lock()
            .unwrap()
            .push((item_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn add_labels(&self, item_id: &str, labels: &[String]) -> Result<()> {
        self.labels
            .lock()
            .unwrap()
            .push((item_id.to_string(), labels.to_vec()));
        Ok(())
    }

    async fn update_description(&self, item_id: &str, description: &str) -> Result<()> {
        self.descriptions
            .lock()
            .unwrap()
            .push((item_id.to_string(), description.to_string()));
        Ok(())
    }
}

/// Generator with a canned output per task.
pub struct ScriptedGenerator {
    outputs: Mutex<HashMap<GenerationTask, Value>>,
    failing: Mutex<HashSet<GenerationTask>>,
    calls: Mutex<Vec<GenerationTask>>,
    held: AtomicBool,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        let outputs = HashMap::from([
            (
                GenerationTask::RefinementAnalysis,
                json!({"summary": "Export invoices as files", "questions": []}),
            ),
            (
                GenerationTask::RefinedDescription,
                json!({"description": "Refined: export invoices", "labels": ["billing"]}),
            ),
            (
                GenerationTask::UserStories,
                json!({
                    "summary": "Two stories",
                    "stories": [{"title": "Export CSV"}, {"title": "Export PDF"}]
                }),
            ),
            (
                GenerationTask::SolutionOptions,
                json!({"options": [{"id": "A", "label": "Background job"}]}),
            ),
            (
                GenerationTask::TechnicalPlan,
                json!({"document": "# Plan\n\nUse a background job.", "summary": "Background job"}),
            ),
            (
                GenerationTask::CodeChanges,
                json!({
                    "summary": "Add exporter",
                    "files": [{"path": "src/export.rs", "content": "pub fn export() {}\n"}]
                }),
            ),
        ]);
        Self {
            outputs: Mutex::new(outputs),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            held: AtomicBool::new(false),
        }
    }
}

impl ScriptedGenerator {
    pub fn set(&self, task: GenerationTask, output: Value) {
        self.outputs.lock().unwrap().insert(task, output);
    }

    pub fn fail_task(&self, task: GenerationTask) {
        self.failing.lock().unwrap().insert(task);
    }

    /// Block every generation until the run is cancelled.
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<GenerationTask> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        self.calls.lock().unwrap().push(request.task);
        if self.held.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(&request.task) {
            bail!("model unavailable for {}", request.task.as_str());
        }
        let output = self.outputs.lock().unwrap().get(&request.task).cloned();
        Ok(output.unwrap_or(Value::Null))
    }
}

#[derive(Default)]
pub struct MockDocuments {
    saved: Mutex<Vec<(String, DocumentKind, String)>>,
}

impl MockDocuments {
    pub fn saved(&self) -> Vec<(String, DocumentKind, String)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentStore for MockDocuments {
    async fn save(&self, item: &WorkItem, kind: DocumentKind, content: &str) -> Result<String> {
        self.saved
            .lock()
            .unwrap()
            .push((item.id.clone(), kind, content.to_string()));
        Ok(format!("mem://{}/{}", item.identifier, kind.as_str()))
    }
}

#[derive(Default)]
pub struct MockSourceControl {
    opened: Mutex<Vec<String>>,
}

impl MockSourceControl {
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceControl for MockSourceControl {
    async fn open_pull_request(&self, item: &WorkItem, _changes: &Value) -> Result<String> {
        let mut opened = self.opened.lock().unwrap();
        opened.push(item.id.clone());
        Ok(format!("https://git.example.test/pulls/{}", opened.len()))
    }
}

/// A fully wired engine over an in-memory store and mock collaborators,
/// with its signal and follow-up loops running.
pub struct TestHarness {
    pub db: DbHandle,
    pub services: Arc<Services>,
    pub runtime: Arc<Runtime>,
    pub router: Arc<TriggerRouter>,
    pub tracker: Arc<MockTracker>,
    pub generator: Arc<ScriptedGenerator>,
    pub documents: Arc<MockDocuments>,
    pub source_control: Arc<MockSourceControl>,
    handles: Vec<JoinHandle<()>>,
}

impl TestHarness {
    pub async fn with_flags(flags: FeatureFlags) -> Self {
        let mut config = FlowConfig::default();
        config.features = flags;
        config.pipeline.retry_backoff_ms = 1;
        config.tracker.bot_user_id = Some(BOT_USER.to_string());

        let db = DbHandle::in_memory().unwrap();
        let tracker = Arc::new(MockTracker::default());
        let generator = Arc::new(ScriptedGenerator::default());
        let documents = Arc::new(MockDocuments::default());
        let source_control = Arc::new(MockSourceControl::default());
        let collab = Collaborators {
            tracker: tracker.clone(),
            generator: generator.clone(),
            retriever: Arc::new(NullRetriever),
            documents: documents.clone(),
            source_control: source_control.clone(),
        };

        let mut engine = Engine::build(&config, db.clone(), collab).unwrap();
        let handles = engine.start(false).await.unwrap();
        Self {
            db,
            services: engine.services.clone(),
            runtime: engine.runtime.clone(),
            router: engine.router.clone(),
            tracker,
            generator,
            documents,
            source_control,
            handles,
        }
    }

    pub fn executor(&self) -> StepExecutor {
        StepExecutor::new(Arc::new(self.db.clone()), Duration::from_millis(1))
    }

    pub async fn insert_item(&self, item: &WorkItem) {
        let upsert = ItemUpsert {
            id: item.id.clone(),
            identifier: item.identifier.clone(),
            status: item.status.clone(),
            parent_id: item.parent_id.clone(),
            team_id: item.team_id.clone(),
            title: Some(item.title.clone()),
            description: Some(item.description.clone()),
        };
        self.db.call(move |db| db.upsert_item(&upsert)).await.unwrap();
    }

    pub async fn item(&self, id: &str) -> WorkItem {
        let id = id.to_string();
        self.db.call(move |db| db.get_item(&id)).await.unwrap().unwrap()
    }

    pub async fn status_of(&self, id: &str) -> String {
        self.item(id).await.status
    }

    /// Poll until the run reaches `state`, returning whatever was last seen
    /// once the wait expires.
    pub async fn wait_for_state(&self, run_id: &str, state: RunState) -> RunRecord {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let id = run_id.to_string();
            let run = self.db.call(move |db| db.get_run(&id)).await.unwrap().unwrap();
            if run.state == state || tokio::time::Instant::now() >= deadline {
                return run;
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Poll until `status` appears in the tracker's status history for the
    /// item.
    pub async fn wait_for_status(&self, id: &str, status: &str) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self.tracker.statuses_for(id).iter().any(|s| s == status) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL).await;
        }
    }

    pub async fn wait_for_runs(&self, id: &str, count: usize) -> Vec<RunRecord> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let key = id.to_string();
            let runs = self.db.call(move |db| db.runs_for_item(&key)).await.unwrap();
            if runs.len() >= count || tokio::time::Instant::now() >= deadline {
                return runs;
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
