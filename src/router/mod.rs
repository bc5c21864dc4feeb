//! Trigger Router: turns inbound tracker events into phase runs, cascades,
//! delivered answers and commands.
//!
//! | Event           | Handling                                                        |
//! |-----------------|-----------------------------------------------------------------|
//! | issue-created   | register the item (status, parent, team); never starts a phase  |
//! | issue-updated   | status unchanged → drop; else evaluate the new status           |
//! | comment-created | reply grammar under a question → answer; else slash command     |
//! | comment-updated | same as comment-created                                         |
//!
//! Evaluating a status: unknown → no trigger; cascade-eligible with children →
//! cascade (the parent is a container and runs nothing itself); otherwise
//! rollup first when eligible, then start the phase if it is a trigger status.

mod commands;
mod events;

pub use commands::{Command, parse_command};
pub use events::{CommentEvent, Envelope, IssueEvent, TrackerEvent, parse_event};

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::broker::{DeliveryOutcome, parse_reply};
use crate::errors::RouteError;
use crate::models::{ItemUpsert, ResponseType, RunState, StatusObservation, WorkItem};
use crate::pipeline::Services;
use crate::propagate::{CascadeResult, Propagator};
use crate::runtime::{Runtime, StartOutcome};
use crate::status::{Phase, Stage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum NoTriggerReason {
    Malformed(String),
    UnknownStatus(String),
    /// The stored status already matches: an echo of our own write or a
    /// redelivered event.
    StatusUnchanged,
    NotATriggerStatus(String),
    OwnComment,
    /// Neither an answer to a pending question nor a command.
    Commentary,
}

impl fmt::Display for NoTriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "malformed event: {}", reason),
            Self::UnknownStatus(status) => write!(f, "unknown status '{}'", status),
            Self::StatusUnchanged => write!(f, "status unchanged"),
            Self::NotATriggerStatus(status) => write!(f, "'{}' is not a trigger status", status),
            Self::OwnComment => write!(f, "own comment"),
            Self::Commentary => write!(f, "not an answer or command"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    NoTrigger {
        reason: NoTriggerReason,
    },
    Duplicate {
        delivery_key: String,
    },
    Registered {
        item_id: String,
    },
    Started {
        run_id: String,
        phase: Phase,
    },
    AlreadyRunning {
        item_id: String,
        phase: Phase,
        run_id: Option<String>,
    },
    Cascaded(CascadeResult),
    AnswerDelivered {
        question_id: String,
        response_type: ResponseType,
    },
    AnswerIgnored {
        question_id: String,
    },
    Command {
        command: Command,
        run_id: Option<String>,
        detail: String,
    },
}

impl RouteOutcome {
    fn no_trigger(reason: NoTriggerReason) -> Self {
        Self::NoTrigger { reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeSummary {
    pub children_count: usize,
    pub cascaded_ids: Vec<String>,
    pub skipped_ids: Vec<String>,
}

/// Response body for a routed webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStartResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascaded: Option<CascadeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PipelineStartResponse {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            run_id: None,
            phase: None,
            cascaded: None,
            reason: Some(reason.into()),
        }
    }

    fn accepted() -> Self {
        Self {
            accepted: true,
            run_id: None,
            phase: None,
            cascaded: None,
            reason: None,
        }
    }
}

impl From<&RouteOutcome> for PipelineStartResponse {
    fn from(outcome: &RouteOutcome) -> Self {
        match outcome {
            RouteOutcome::Started { run_id, phase } => Self {
                run_id: Some(run_id.clone()),
                phase: Some(*phase),
                ..Self::accepted()
            },
            RouteOutcome::Cascaded(result) => Self {
                cascaded: Some(CascadeSummary {
                    children_count: result.children_count,
                    cascaded_ids: result.cascaded.clone(),
                    skipped_ids: result.skipped_ids(),
                }),
                ..Self::accepted()
            },
            RouteOutcome::Command { run_id, .. } => Self {
                run_id: run_id.clone(),
                ..Self::accepted()
            },
            RouteOutcome::Registered { .. } | RouteOutcome::AnswerDelivered { .. } => Self::accepted(),
            RouteOutcome::AlreadyRunning { run_id, phase, .. } => Self {
                run_id: run_id.clone(),
                phase: Some(*phase),
                ..Self::rejected("a run for this phase is already active")
            },
            RouteOutcome::NoTrigger { reason } => Self::rejected(reason.to_string()),
            RouteOutcome::Duplicate { .. } => Self::rejected("duplicate delivery"),
            RouteOutcome::AnswerIgnored { .. } => Self::rejected("question already answered"),
        }
    }
}

pub struct TriggerRouter {
    services: Arc<Services>,
    runtime: Arc<Runtime>,
    propagator: Propagator,
    bot_user_id: Option<String>,
}

impl TriggerRouter {
    pub fn new(runtime: Arc<Runtime>, bot_user_id: Option<String>) -> Self {
        let services = runtime.services().clone();
        let propagator = Propagator::new(
            services.db.clone(),
            services.table.clone(),
            services.status.clone(),
        );
        Self {
            services,
            runtime,
            propagator,
            bot_user_id,
        }
    }

    /// Route a raw webhook body. Malformed payloads are a `NoTrigger`, never
    /// an error.
    pub async fn route_raw(&self, raw: &[u8]) -> Result<RouteOutcome, RouteError> {
        match parse_event(raw) {
            Ok(envelope) => self.route(envelope).await,
            Err(RouteError::Malformed(reason)) => {
                tracing::warn!(reason = %reason, "rejected malformed event");
                Ok(RouteOutcome::no_trigger(NoTriggerReason::Malformed(reason)))
            }
            Err(e) => Err(e),
        }
    }

    /// Route one event. A delivery key is only kept once the event was
    /// handled; on error it is dropped again so the tracker's redelivery is
    /// routed instead of discarded as a duplicate.
    pub async fn route(&self, envelope: Envelope) -> Result<RouteOutcome, RouteError> {
        let delivery_key = envelope.delivery_key.clone();
        if let Some(key) = delivery_key.clone() {
            let k = key.clone();
            let first = self.services.db.call(move |db| db.record_delivery(&k)).await?;
            if !first {
                tracing::info!(delivery_key = %key, "duplicate delivery dropped");
                return Ok(RouteOutcome::Duplicate { delivery_key: key });
            }
        }

        let kind = envelope.event.kind();
        let item_id = envelope.event.item_id().to_string();
        let routed = match envelope.event {
            TrackerEvent::IssueCreated(issue) => self.route_issue(issue, true).await,
            TrackerEvent::IssueUpdated(issue) => self.route_issue(issue, false).await,
            TrackerEvent::CommentCreated(comment) | TrackerEvent::CommentUpdated(comment) => {
                self.route_comment(comment).await
            }
        };
        let outcome = match routed {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(event = kind, item_id = %item_id, error = %e, "event handling failed");
                if let Some(key) = delivery_key {
                    let k = key.clone();
                    if let Err(forget) = self.services.db.call(move |db| db.forget_delivery(&k)).await {
                        tracing::warn!(delivery_key = %key, error = %forget, "failed to release delivery key");
                    }
                }
                return Err(e);
            }
        };
        tracing::debug!(event = kind, item_id = %item_id, outcome = ?outcome, "event routed");
        Ok(outcome)
    }

    async fn route_issue(&self, issue: IssueEvent, created: bool) -> Result<RouteOutcome, RouteError> {
        let status = issue.status.clone();
        let upsert = ItemUpsert {
            id: issue.item_id.clone(),
            identifier: issue.identifier,
            status: issue.status,
            parent_id: issue.parent_id,
            team_id: issue.team_id,
            title: issue.title,
            description: issue.description,
        };
        let observation = self.services.db.call(move |db| db.upsert_item(&upsert)).await?;

        if created {
            tracing::info!(item_id = %issue.item_id, "work item registered");
            return Ok(RouteOutcome::Registered {
                item_id: issue.item_id,
            });
        }
        if observation == StatusObservation::Unchanged {
            return Ok(RouteOutcome::no_trigger(NoTriggerReason::StatusUnchanged));
        }

        let evaluated = match self.load_item(&issue.item_id).await {
            Ok(item) => self.evaluate(item).await,
            Err(e) => Err(e),
        };
        if evaluated.is_err() {
            self.take_back(&issue.item_id, &status, observation).await;
        }
        evaluated
    }

    /// Undo a status observation whose evaluation failed, so a redelivery of
    /// the same event is seen as a change again. Nothing is undone if the
    /// item moved on in the meantime.
    async fn take_back(&self, item_id: &str, status: &str, observation: StatusObservation) {
        let (id, s) = (item_id.to_string(), status.to_string());
        let undone = match observation {
            StatusObservation::Changed { previous } => {
                self.services
                    .db
                    .call(move |db| db.compare_and_set_status(&id, &s, &previous))
                    .await
            }
            StatusObservation::New => self.services.db.call(move |db| db.forget_item(&id, &s)).await,
            StatusObservation::Unchanged => return,
        };
        match undone {
            Ok(undone) => tracing::debug!(item_id, status, undone, "status observation taken back"),
            Err(e) => tracing::warn!(item_id, status, error = %e, "failed to take back status observation"),
        }
    }

    /// Evaluate an item's current status as if it had just been set.
    ///
    /// Also used for statuses this process wrote itself (cascaded children,
    /// rolled-up parents, completed runs), whose tracker echoes are dropped
    /// as unchanged.
    pub fn evaluate(&self, item: WorkItem) -> BoxFuture<'_, Result<RouteOutcome, RouteError>> {
        Box::pin(async move {
            let Some(entry) = self.services.table.get(&item.status).cloned() else {
                tracing::debug!(item_id = %item.id, status = %item.status, "unknown status");
                return Ok(RouteOutcome::no_trigger(NoTriggerReason::UnknownStatus(
                    item.status,
                )));
            };

            if entry.cascade {
                let id = item.id.clone();
                let has_children = self.services.db.call(move |db| db.has_children(&id)).await?;
                if has_children {
                    let result = self
                        .propagator
                        .cascade(&item, &entry.name, |child| async move {
                            self.evaluate(child).await.map_err(anyhow::Error::from)
                        })
                        .await?;
                    return Ok(RouteOutcome::Cascaded(result));
                }
            }

            if entry.rollup {
                self.roll_up(&item).await;
            }

            match entry.trigger_phase() {
                Some(phase) => self.start(&item, phase).await,
                None => Ok(RouteOutcome::no_trigger(NoTriggerReason::NotATriggerStatus(
                    entry.name,
                ))),
            }
        })
    }

    /// Roll the item's parent forward. Failures are logged and never stop
    /// the caller.
    async fn roll_up(&self, item: &WorkItem) {
        let rolled = match self.propagator.rollup(item).await {
            Ok(Some(result)) if result.changed => result,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "rollup failed");
                return;
            }
        };
        let parent = match self.load_item(&rolled.parent_id).await {
            Ok(parent) => parent,
            Err(e) => {
                tracing::warn!(parent_id = %rolled.parent_id, error = %e, "rolled-up parent vanished");
                return;
            }
        };
        match self.evaluate(parent).await {
            Ok(outcome) => {
                tracing::info!(parent_id = %rolled.parent_id, outcome = ?outcome, "rolled-up parent evaluated")
            }
            Err(e) => tracing::warn!(parent_id = %rolled.parent_id, error = %e, "rolled-up parent evaluation failed"),
        }
    }

    async fn start(&self, item: &WorkItem, phase: Phase) -> Result<RouteOutcome, RouteError> {
        Ok(match self.runtime.start(item, phase).await? {
            StartOutcome::Started(run) => RouteOutcome::Started { run_id: run.id, phase },
            StartOutcome::AlreadyActive { run_id } => RouteOutcome::AlreadyRunning {
                item_id: item.id.clone(),
                phase,
                run_id,
            },
        })
    }

    async fn route_comment(&self, comment: CommentEvent) -> Result<RouteOutcome, RouteError> {
        if self.bot_user_id.as_deref() == Some(comment.author_id.as_str()) {
            return Ok(RouteOutcome::no_trigger(NoTriggerReason::OwnComment));
        }

        if let Some(parent) = comment.parent_comment_id.as_deref()
            && let Some(answer) = parse_reply(&comment.body)
        {
            match self
                .services
                .broker
                .deliver_answer(parent, answer, &comment.author_id, Some(&comment.comment_id))
                .await?
            {
                DeliveryOutcome::Delivered(payload) => {
                    return Ok(RouteOutcome::AnswerDelivered {
                        question_id: payload.question_id,
                        response_type: payload.response_type,
                    });
                }
                DeliveryOutcome::AlreadyAnswered { question_id } => {
                    return Ok(RouteOutcome::AnswerIgnored { question_id });
                }
                DeliveryOutcome::NotAQuestionReply => {}
            }
        }

        match parse_command(&comment.body) {
            Some(command) => self.run_command(command, &comment).await,
            None => Ok(RouteOutcome::no_trigger(NoTriggerReason::Commentary)),
        }
    }

    async fn run_command(&self, command: Command, comment: &CommentEvent) -> Result<RouteOutcome, RouteError> {
        let item = self.load_item(&comment.item_id).await?;
        tracing::info!(item_id = %item.id, command = command.as_str(), author = %comment.author_id, "command received");

        let (run_id, detail) = match command {
            Command::Retry => {
                let phase = self
                    .services
                    .table
                    .get(&item.status)
                    .filter(|e| matches!(e.stage, Stage::Failed | Stage::Trigger))
                    .and_then(|e| e.phase);
                match phase {
                    Some(phase) => match self.start(&item, phase).await? {
                        RouteOutcome::Started { run_id, .. } => {
                            (Some(run_id), format!("{} restarted", phase))
                        }
                        _ => (None, format!("{} is already running", phase)),
                    },
                    None => (None, format!("nothing to retry from '{}'", item.status)),
                }
            }
            Command::Cancel => {
                let cancelled = self.runtime.cancel_item(&item.id).await?;
                (None, format!("cancelled {} run(s)", cancelled.len()))
            }
            Command::Status => {
                let body = self.status_summary(&item).await?;
                self.services
                    .collab
                    .tracker
                    .post_comment(&item.id, &body, Some(&comment.comment_id))
                    .await?;
                (None, "status posted".to_string())
            }
        };
        Ok(RouteOutcome::Command {
            command,
            run_id,
            detail,
        })
    }

    async fn status_summary(&self, item: &WorkItem) -> Result<String, RouteError> {
        let id = item.id.clone();
        let (runs, pending) = self
            .services
            .db
            .call(move |db| {
                let runs = db.runs_for_item(&id)?;
                let mut pending = 0;
                for run in runs.iter().filter(|r| r.state == RunState::Blocked) {
                    pending += db.pending_count_for_run(&run.id)?;
                }
                Ok((runs, pending))
            })
            .await?;

        let mut body = format!("**Status:** {}\n", item.status);
        let active: Vec<_> = runs.iter().filter(|r| r.state.is_active()).collect();
        if active.is_empty() {
            body.push_str("No active runs.\n");
        } else {
            for run in active {
                body.push_str(&format!("- {} `{}`: {}\n", run.phase, run.id, run.state.as_str()));
            }
        }
        if pending > 0 {
            body.push_str(&format!("{} question(s) awaiting an answer.\n", pending));
        }
        Ok(body)
    }

    async fn load_item(&self, id: &str) -> Result<WorkItem, RouteError> {
        let key = id.to_string();
        self.services
            .db
            .call(move |db| db.get_item(&key))
            .await?
            .ok_or_else(|| RouteError::ItemNotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::GenerationTask;
    use crate::config::FeatureFlags;
    use crate::models::{PendingQuestion, QuestionKind, QuestionState};
    use crate::phases::PhaseRegistry;
    use crate::test_support::{BOT_USER, TestHarness, work_item};
    use chrono::Utc;
    use serde_json::{Value, json};

    fn issue(item: &str, status: &str) -> Value {
        json!({
            "eventType": "issue", "action": "update",
            "itemId": item, "identifier": item.to_uppercase(), "status": status
        })
    }

    fn reply(parent: &str, body: &str, id: &str) -> Value {
        json!({
            "eventType": "comment", "action": "create",
            "commentId": id, "itemId": "item-1", "parentCommentId": parent,
            "body": body, "authorId": "alice", "createdAt": "2026-01-05T10:00:00Z"
        })
    }

    async fn route(h: &TestHarness, event: Value) -> RouteOutcome {
        h.router.route_raw(event.to_string().as_bytes()).await.unwrap()
    }

    async fn started(h: &TestHarness, item: &str, status: &str) -> String {
        match route(h, issue(item, status)).await {
            RouteOutcome::Started { run_id, .. } => run_id,
            other => panic!("Expected a run to start, got {:?}", other),
        }
    }

    /// Wait for the run to block, then return its open question.
    async fn open_question(h: &TestHarness, run_id: &str) -> PendingQuestion {
        let run = h.wait_for_state(run_id, RunState::Blocked).await;
        assert_eq!(run.state, RunState::Blocked);
        let id = run_id.to_string();
        h.db.call(move |db| db.questions_for_run(&id))
            .await
            .unwrap()
            .into_iter()
            .find(|q| q.state == QuestionState::Pending)
            .expect("an open question")
    }

    async fn step_output(h: &TestHarness, run_id: &str, step: &str) -> Value {
        let id = run_id.to_string();
        let journal = h.db.call(move |db| db.step_results(&id)).await.unwrap();
        journal
            .into_iter()
            .find(|r| r.name == step)
            .map(|r| r.output)
            .unwrap_or(Value::Null)
    }

    fn two_solutions(h: &TestHarness) {
        h.generator.set(
            GenerationTask::SolutionOptions,
            json!({"options": [
                {"id": "A", "label": "Background job"},
                {"id": "B", "label": "Streaming export"}
            ]}),
        );
    }

    fn approvals(plan_approval: bool, code_approval: bool) -> FeatureFlags {
        FeatureFlags {
            plan_approval,
            code_approval,
            pull_requests: true,
            ..FeatureFlags::none()
        }
    }

    async fn expire_questions(h: &TestHarness) {
        let report = h
            .runtime
            .sweep(Utc::now() + chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
    }

    #[tokio::test]
    async fn test_unknown_status_never_starts_a_run() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        let outcome = route(&h, issue("item-1", "Needs Triage")).await;
        assert_eq!(
            outcome,
            RouteOutcome::NoTrigger {
                reason: NoTriggerReason::UnknownStatus("Needs Triage".into())
            }
        );
        let runs = h.db.call(|db| db.runs_for_item("item-1")).await.unwrap();
        assert!(runs.is_empty());
        // Stored verbatim so the next real change is still detected.
        assert_eq!(h.status_of("item-1").await, "Needs Triage");
    }

    #[tokio::test]
    async fn test_malformed_event_is_no_trigger() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        let outcome = route(&h, json!({"eventType": "issue", "action": "update"})).await;
        assert!(matches!(
            outcome,
            RouteOutcome::NoTrigger { reason: NoTriggerReason::Malformed(_) }
        ));
        let response = PipelineStartResponse::from(&outcome);
        assert!(!response.accepted);
    }

    #[tokio::test]
    async fn test_end_to_end_refinement_with_two_questions() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.generator.set(
            crate::collab::GenerationTask::RefinementAnalysis,
            json!({
                "summary": "Export invoices",
                "questions": [
                    {"prompt": "Which currency?", "assumption": "EUR"},
                    {"prompt": "Which format?", "options": [{"label": "CSV"}, {"label": "PDF"}]}
                ]
            }),
        );

        let RouteOutcome::Started { run_id, phase } = route(&h, issue("item-1", "Needs Refinement")).await else {
            panic!("Expected a run to start");
        };
        assert_eq!(phase, Phase::Refinement);

        let blocked = h.wait_for_state(&run_id, RunState::Blocked).await;
        assert_eq!(blocked.state, RunState::Blocked);
        assert_eq!(h.status_of("item-1").await, "Refinement In Progress");

        let id = run_id.clone();
        let questions = h.db.call(move |db| db.questions_for_run(&id)).await.unwrap();
        assert_eq!(questions.len(), 2);

        // Ordinary commentary under a question is not an answer.
        let chatter = route(&h, reply(&questions[0].comment_id, "let me check", "c-100")).await;
        assert_eq!(chatter, RouteOutcome::NoTrigger { reason: NoTriggerReason::Commentary });

        let first = route(&h, reply(&questions[0].comment_id, "APPROVE", "c-101")).await;
        assert!(matches!(first, RouteOutcome::AnswerDelivered { .. }));
        let second = route(&h, reply(&questions[1].comment_id, "OPTION:b", "c-102")).await;
        assert!(matches!(
            second,
            RouteOutcome::AnswerDelivered { response_type: ResponseType::OptionSelected, .. }
        ));

        let done = h.wait_for_state(&run_id, RunState::Completed).await;
        assert_eq!(done.state, RunState::Completed);
        assert_eq!(h.status_of("item-1").await, "Refinement Ready");

        let journal = h.db.call(move |db| db.step_results(&run_id)).await.unwrap();
        let clarify = journal.iter().find(|r| r.name == "clarify").unwrap();
        assert_eq!(clarify.output["answers"][0]["resolution"], "accepted");
        assert_eq!(clarify.output["answers"][1]["answer"], "PDF");
    }

    #[tokio::test]
    async fn test_blocking_failure_ends_in_failed_status() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.generator.fail_task(crate::collab::GenerationTask::RefinedDescription);

        let RouteOutcome::Started { run_id, .. } = route(&h, issue("item-1", "Needs Refinement")).await else {
            panic!("Expected a run to start");
        };
        let run = h.wait_for_state(&run_id, RunState::Failed).await;
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(h.status_of("item-1").await, "Refinement Failed");
    }

    #[tokio::test]
    async fn test_double_delivery_signals_once() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.generator.set(
            crate::collab::GenerationTask::RefinementAnalysis,
            json!({"summary": "s", "questions": [{"prompt": "Which currency?", "assumption": "EUR"}]}),
        );
        let RouteOutcome::Started { run_id, .. } = route(&h, issue("item-1", "Needs Refinement")).await else {
            panic!("Expected a run to start");
        };
        h.wait_for_state(&run_id, RunState::Blocked).await;
        let id = run_id.clone();
        let question = h.db.call(move |db| db.questions_for_run(&id)).await.unwrap().remove(0);

        let body = reply(&question.comment_id, "REJECT: USD as well", "c-200");
        assert!(matches!(route(&h, body.clone()).await, RouteOutcome::AnswerDelivered { .. }));
        // Exact redelivery is caught by the delivery key.
        assert!(matches!(route(&h, body).await, RouteOutcome::Duplicate { .. }));
        // A second, different reply finds the question already answered.
        let late = route(&h, reply(&question.comment_id, "APPROVE", "c-201")).await;
        assert_eq!(late, RouteOutcome::AnswerIgnored { question_id: question.id.clone() });

        let stored = h.db.call(move |db| db.get_question(&question.id)).await.unwrap().unwrap();
        assert_eq!(stored.state, QuestionState::Answered);
        assert_eq!(stored.answer.unwrap().custom_text.as_deref(), Some("USD as well"));
    }

    #[tokio::test]
    async fn test_status_echo_is_dropped() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        let RouteOutcome::Started { run_id, .. } = route(&h, issue("item-1", "Needs Refinement")).await else {
            panic!("Expected a run to start");
        };
        h.wait_for_state(&run_id, RunState::Completed).await;

        let echo = route(&h, issue("item-1", "Refinement Ready")).await;
        assert_eq!(echo, RouteOutcome::NoTrigger { reason: NoTriggerReason::StatusUnchanged });
    }

    #[tokio::test]
    async fn test_parent_with_children_cascades_instead_of_running() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.insert_item(&work_item("parent", "Backlog", None)).await;
        for id in ["a", "b", "c"] {
            h.insert_item(&work_item(id, "Backlog", Some("parent"))).await;
        }
        h.insert_item(&work_item("d", "Done", Some("parent"))).await;

        let outcome = route(&h, issue("parent", "Needs Refinement")).await;
        let RouteOutcome::Cascaded(result) = &outcome else {
            panic!("Expected a cascade, got {:?}", outcome);
        };
        assert_eq!(result.children_count, 4);
        assert_eq!(result.cascaded, vec!["a", "b", "c"]);
        assert_eq!(result.skipped_ids(), vec!["d"]);

        let response = PipelineStartResponse::from(&outcome);
        assert!(response.accepted);
        assert_eq!(response.cascaded.unwrap().cascaded_ids.len(), 3);

        let parent_runs = h.db.call(|db| db.runs_for_item("parent")).await.unwrap();
        assert!(parent_runs.is_empty());
        for id in ["a", "b", "c"] {
            let runs = h.db.call(move |db| db.runs_for_item(id)).await.unwrap();
            assert_eq!(runs.len(), 1, "child {} should have started refinement", id);
        }
    }

    #[tokio::test]
    async fn test_children_completing_roll_parent_forward() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.insert_item(&work_item("parent", "Backlog", None)).await;
        h.insert_item(&work_item("a", "Backlog", Some("parent"))).await;
        h.insert_item(&work_item("b", "Backlog", Some("parent"))).await;

        route(&h, issue("parent", "Needs Refinement")).await;

        // Both children finish refinement; the last one rolls the parent to
        // "Write User Stories", which cascades again and starts the next phase.
        assert!(h.wait_for_status("parent", "Write User Stories").await);
        for id in ["a", "b"] {
            let runs = h.wait_for_runs(id, 2).await;
            assert!(runs.iter().any(|r| r.phase == Phase::UserStory));
        }
    }

    #[tokio::test]
    async fn test_second_trigger_while_active_is_rejected() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.generator.hold();
        let RouteOutcome::Started { run_id, .. } = route(&h, issue("item-1", "Needs Refinement")).await else {
            panic!("Expected a run to start");
        };
        // Move away and back while the first run is still going.
        h.db.call(|db| db.set_status("item-1", "Backlog")).await.unwrap();
        let again = route(&h, issue("item-1", "Needs Refinement")).await;
        assert_eq!(
            again,
            RouteOutcome::AlreadyRunning {
                item_id: "item-1".into(),
                phase: Phase::Refinement,
                run_id: Some(run_id.clone())
            }
        );
        h.runtime.cancel(&run_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_commands() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.insert_item(&work_item("item-1", "Refinement Failed", None)).await;

        let status = route(&h, reply("none", "/status", "c-300")).await;
        assert!(matches!(status, RouteOutcome::Command { command: Command::Status, .. }));
        let comments = h.tracker.comments_for("item-1");
        assert!(comments.last().unwrap().body.contains("Refinement Failed"));

        let retry = route(&h, reply("none", "/retry", "c-301")).await;
        let RouteOutcome::Command { command: Command::Retry, run_id: Some(run_id), .. } = retry else {
            panic!("Expected retry to start a run, got {:?}", retry);
        };
        h.wait_for_state(&run_id, RunState::Completed).await;
        assert_eq!(h.status_of("item-1").await, "Refinement Ready");

        let own = json!({
            "eventType": "comment", "action": "create", "commentId": "c-302", "itemId": "item-1",
            "body": "/retry", "authorId": "forgeflow-bot", "createdAt": "2026-01-05T10:00:00Z"
        });
        assert_eq!(
            route(&h, own).await,
            RouteOutcome::NoTrigger { reason: NoTriggerReason::OwnComment }
        );
    }

    #[tokio::test]
    async fn test_cascade_starts_children_while_tracker_rejects_status_writes() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.insert_item(&work_item("parent", "Backlog", None)).await;
        h.insert_item(&work_item("a", "Backlog", Some("parent"))).await;
        h.tracker.fail_status_updates(true);

        let outcome = route(&h, issue("parent", "Needs Refinement")).await;
        let RouteOutcome::Cascaded(result) = &outcome else {
            panic!("Expected a cascade, got {:?}", outcome);
        };
        assert_eq!(result.cascaded, vec!["a"]);
        assert!(result.skipped.is_empty());
        let runs = h.db.call(|db| db.runs_for_item("a")).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].phase, Phase::Refinement);
    }

    #[tokio::test]
    async fn test_failed_trigger_is_routed_again_on_redelivery() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.insert_item(&work_item("item-1", "Backlog", None)).await;
        let broken = TriggerRouter::new(
            Arc::new(Runtime::new(h.services.clone(), PhaseRegistry::empty(), None)),
            Some(BOT_USER.to_string()),
        );
        let mut event = issue("item-1", "Needs Refinement");
        event["deliveryId"] = json!("d-42");
        let raw = event.to_string();

        assert!(broken.route_raw(raw.as_bytes()).await.is_err());
        assert_eq!(h.status_of("item-1").await, "Backlog");

        match h.router.route_raw(raw.as_bytes()).await.unwrap() {
            RouteOutcome::Started { phase, .. } => assert_eq!(phase, Phase::Refinement),
            other => panic!("Expected the redelivery to start a run, got {:?}", other),
        }
        assert!(matches!(
            h.router.route_raw(raw.as_bytes()).await.unwrap(),
            RouteOutcome::Duplicate { .. }
        ));
    }

    #[tokio::test]
    async fn test_first_sighting_is_forgotten_when_its_trigger_fails() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        let broken = TriggerRouter::new(
            Arc::new(Runtime::new(h.services.clone(), PhaseRegistry::empty(), None)),
            Some(BOT_USER.to_string()),
        );
        let raw = issue("item-9", "Needs Refinement").to_string();

        assert!(broken.route_raw(raw.as_bytes()).await.is_err());
        assert!(h.db.call(|db| db.get_item("item-9")).await.unwrap().is_none());
        assert!(matches!(
            h.router.route_raw(raw.as_bytes()).await.unwrap(),
            RouteOutcome::Started { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_command_can_be_redelivered() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        h.insert_item(&work_item("item-1", "Refinement Failed", None)).await;
        let event = reply("none", "/status", "c-500").to_string();

        h.tracker.fail_comments(true);
        assert!(h.router.route_raw(event.as_bytes()).await.is_err());

        h.tracker.fail_comments(false);
        let outcome = h.router.route_raw(event.as_bytes()).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Command { command: Command::Status, .. }));
        assert_eq!(h.tracker.comments_for("item-1").len(), 1);
    }

    #[tokio::test]
    async fn test_picked_solution_feeds_the_plan() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        two_solutions(&h);
        let run_id = started(&h, "item-1", "Plan Technical Approach").await;
        let question = open_question(&h, &run_id).await;
        assert_eq!(question.kind, QuestionKind::SolutionChoice);

        route(&h, reply(&question.comment_id, "OPTION:b", "c-400")).await;
        let run = h.wait_for_state(&run_id, RunState::Completed).await;
        assert_eq!(run.state, RunState::Completed);
        let choice = step_output(&h, &run_id, "choose_solution").await;
        assert_eq!(choice["choice"]["id"], "B");
        assert_eq!(choice["decidedBy"], "alice");
    }

    #[tokio::test]
    async fn test_rejecting_every_solution_fails_the_phase() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        two_solutions(&h);
        let run_id = started(&h, "item-1", "Plan Technical Approach").await;
        let question = open_question(&h, &run_id).await;

        route(&h, reply(&question.comment_id, "REJECT: neither handles a million rows", "c-401")).await;
        let run = h.wait_for_state(&run_id, RunState::Failed).await;
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.unwrap().contains("All solution options rejected"));
        assert_eq!(h.status_of("item-1").await, "Technical Plan Failed");
        assert!(!h.generator.calls().contains(&GenerationTask::TechnicalPlan));
    }

    #[tokio::test]
    async fn test_unknown_solution_option_is_fatal() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        two_solutions(&h);
        let run_id = started(&h, "item-1", "Plan Technical Approach").await;
        let question = open_question(&h, &run_id).await;

        route(&h, reply(&question.comment_id, "OPTION:Z", "c-402")).await;
        let run = h.wait_for_state(&run_id, RunState::Failed).await;
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.unwrap().contains("Unknown option 'Z'"));
        assert_eq!(h.status_of("item-1").await, "Technical Plan Failed");
    }

    #[tokio::test]
    async fn test_solution_timeout_takes_the_first_option() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        two_solutions(&h);
        let run_id = started(&h, "item-1", "Plan Technical Approach").await;
        open_question(&h, &run_id).await;

        expire_questions(&h).await;
        let run = h.wait_for_state(&run_id, RunState::Completed).await;
        assert_eq!(run.state, RunState::Completed);
        let choice = step_output(&h, &run_id, "choose_solution").await;
        assert_eq!(choice["choice"]["id"], "A");
        assert_eq!(choice["decidedBy"], "default");
        assert_eq!(h.status_of("item-1").await, "Technical Plan Ready");
    }

    #[tokio::test]
    async fn test_plan_rejection_fails_the_phase() {
        let h = TestHarness::with_flags(approvals(true, false)).await;
        let run_id = started(&h, "item-1", "Plan Technical Approach").await;
        let question = open_question(&h, &run_id).await;
        assert_eq!(question.kind, QuestionKind::Approval);
        assert_eq!(question.step_name, "approve_plan");

        route(&h, reply(&question.comment_id, "REJECT: no rollback story", "c-403")).await;
        let run = h.wait_for_state(&run_id, RunState::Failed).await;
        assert_eq!(run.state, RunState::Failed);
        let error = run.error.unwrap();
        assert!(error.starts_with("approve_plan"));
        assert!(error.contains("rejected by alice: no rollback story"));
        assert_eq!(h.status_of("item-1").await, "Technical Plan Failed");
    }

    #[tokio::test]
    async fn test_approval_timeout_continues_unapproved() {
        let h = TestHarness::with_flags(approvals(true, false)).await;
        let run_id = started(&h, "item-1", "Plan Technical Approach").await;
        open_question(&h, &run_id).await;

        expire_questions(&h).await;
        let run = h.wait_for_state(&run_id, RunState::Completed).await;
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(
            step_output(&h, &run_id, "approve_plan").await,
            json!({"approved": false, "timedOut": true})
        );
        assert_eq!(h.status_of("item-1").await, "Technical Plan Ready");
    }

    #[tokio::test]
    async fn test_approved_code_opens_a_pull_request() {
        let h = TestHarness::with_flags(approvals(false, true)).await;
        let run_id = started(&h, "item-1", "Generate Code").await;
        let question = open_question(&h, &run_id).await;

        route(&h, reply(&question.comment_id, "APPROVE", "c-404")).await;
        let run = h.wait_for_state(&run_id, RunState::Completed).await;
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(
            step_output(&h, &run_id, "approve_code").await,
            json!({"approved": true, "by": "alice"})
        );
        assert_eq!(h.source_control.opened(), vec!["item-1"]);
    }

    #[tokio::test]
    async fn test_rejection_naming_an_option_does_not_approve_code() {
        let h = TestHarness::with_flags(approvals(false, true)).await;
        let run_id = started(&h, "item-1", "Generate Code").await;
        let question = open_question(&h, &run_id).await;

        let outcome = route(
            &h,
            reply(&question.comment_id, "REJECT: option:B would break the public API", "c-405"),
        )
        .await;
        assert!(matches!(
            outcome,
            RouteOutcome::AnswerDelivered { response_type: ResponseType::Rejected, .. }
        ));
        let run = h.wait_for_state(&run_id, RunState::Failed).await;
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(h.status_of("item-1").await, "Code Generation Failed");
        assert!(h.source_control.opened().is_empty());
    }

    #[tokio::test]
    async fn test_option_reply_to_an_approval_is_not_an_approval() {
        let h = TestHarness::with_flags(approvals(false, true)).await;
        let run_id = started(&h, "item-1", "Generate Code").await;
        let question = open_question(&h, &run_id).await;

        route(&h, reply(&question.comment_id, "OPTION:A", "c-406")).await;
        let run = h.wait_for_state(&run_id, RunState::Failed).await;
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.unwrap().contains("not approved"));
        assert!(h.source_control.opened().is_empty());
    }
}
