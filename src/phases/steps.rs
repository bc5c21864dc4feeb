//! Step building blocks shared by the four phase orchestrators.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::broker::{AskOutcome, NO_REASON, QuestionSpec};
use crate::collab::{DocumentKind, GenerationRequest, GenerationTask};
use crate::config::{Feature, PipelineSection};
use crate::errors::StepError;
use crate::models::{PendingQuestion, QuestionKind, QuestionOption, ResponseType, SignalPayload};
use crate::pipeline::{Step, StepContext, StepOutcome, StepOutputs, StepPolicy};
use crate::status::{Phase, Stage};

/// Move the item to its phase status for `stage`.
pub struct SetStatus {
    pub name: &'static str,
    pub phase: Phase,
    pub stage: Stage,
    pub policy: StepPolicy,
}

impl SetStatus {
    pub fn new(name: &'static str, phase: Phase, stage: Stage, settings: &PipelineSection) -> Self {
        Self {
            name,
            phase,
            stage,
            policy: StepPolicy::quick(settings),
        }
    }
}

#[async_trait]
impl Step for SetStatus {
    fn name(&self) -> &str {
        self.name
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let status = ctx
            .services
            .table
            .status_for(self.phase, self.stage)
            .map(|e| e.name.clone())
            .ok_or_else(|| {
                StepError::fatal(format!("No {:?} status configured for {}", self.stage, self.phase))
            })?;
        ctx.services.status.set(&ctx.item.id, &status).await?;
        Ok(StepOutcome::Done(json!({"status": status})))
    }
}

/// Fetch code and document context for later prompts. Optional and
/// non-blocking: a missing index only degrades prompt quality.
pub struct RetrieveContext {
    pub phase: Phase,
    pub policy: StepPolicy,
}

impl RetrieveContext {
    pub fn new(phase: Phase, settings: &PipelineSection) -> Self {
        Self {
            phase,
            policy: StepPolicy::quick(settings)
                .non_blocking()
                .when(Feature::ContextRetrieval),
        }
    }
}

#[async_trait]
impl Step for RetrieveContext {
    fn name(&self) -> &str {
        "retrieve_context"
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let snippets = ctx
            .services
            .collab
            .retriever
            .retrieve(&ctx.item, self.phase)
            .await?;
        Ok(StepOutcome::Done(json!({ "snippets": snippets })))
    }
}

/// One AI generation over the outputs of earlier steps.
pub struct Generate {
    pub name: &'static str,
    pub task: GenerationTask,
    pub inputs: &'static [&'static str],
    /// Output fields that must be present for the result to be usable.
    pub requires: &'static [&'static str],
    pub policy: StepPolicy,
}

impl Generate {
    pub fn new(
        name: &'static str,
        task: GenerationTask,
        inputs: &'static [&'static str],
        requires: &'static [&'static str],
        settings: &PipelineSection,
    ) -> Self {
        Self {
            name,
            task,
            inputs,
            requires,
            policy: StepPolicy::generation(settings),
        }
    }
}

#[async_trait]
impl Step for Generate {
    fn name(&self) -> &str {
        self.name
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs.select(self.inputs)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let output = ctx
            .services
            .collab
            .generator
            .generate(&GenerationRequest {
                task: self.task,
                item: ctx.item.clone(),
                input: ctx.input.clone(),
            })
            .await?;
        for field in self.requires {
            if output.get(field).is_none_or(Value::is_null) {
                return Err(StepError::fatal(format!(
                    "{} output is missing '{}'",
                    self.task.as_str(),
                    field
                )));
            }
        }
        Ok(StepOutcome::Done(output))
    }
}

/// Ask the questions an analysis step raised, each with the assumption the
/// model would otherwise make.
pub struct Clarify {
    pub source: &'static str,
    pub policy: StepPolicy,
}

impl Clarify {
    pub fn new(source: &'static str, settings: &PipelineSection) -> Self {
        Self {
            source,
            policy: StepPolicy::quick(settings).untimed(),
        }
    }

    fn specs(input: &Value) -> Vec<(QuestionSpec, String)> {
        input
            .get("questions")
            .and_then(Value::as_array)
            .map(|questions| {
                questions
                    .iter()
                    .filter_map(|q| {
                        let prompt = q.get("prompt").and_then(Value::as_str)?;
                        let assumption = q
                            .get("assumption")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let text = if assumption.is_empty() {
                            prompt.to_string()
                        } else {
                            format!("{}\n\nAssumption: {}", prompt, assumption)
                        };
                        Some((
                            QuestionSpec {
                                kind: QuestionKind::Clarification,
                                prompt: text,
                                options: parse_options(q.get("options")),
                            },
                            assumption,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Step for Clarify {
    fn name(&self) -> &str {
        "clarify"
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs.get(self.source).cloned().unwrap_or(Value::Null)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let asked = Self::specs(&ctx.input);
        if asked.is_empty() {
            return Ok(StepOutcome::Done(json!({ "answers": [] })));
        }
        let specs: Vec<QuestionSpec> = asked.iter().map(|(spec, _)| spec.clone()).collect();
        let questions = match ctx
            .services
            .broker
            .ask(&ctx.run, &ctx.step_name, &specs)
            .await
            .map_err(|e| StepError::Collaborator(e.into()))?
        {
            AskOutcome::Waiting(ids) => return Ok(StepOutcome::Suspend { questions: ids }),
            AskOutcome::Resolved(questions) => questions,
        };

        let answers: Vec<Value> = questions
            .iter()
            .zip(asked.iter().map(|(_, assumption)| assumption))
            .map(|(q, assumption)| clarification_answer(q, assumption))
            .collect();
        Ok(StepOutcome::Done(json!({ "answers": answers })))
    }
}

fn clarification_answer(question: &PendingQuestion, assumption: &str) -> Value {
    let by = question
        .answer
        .as_ref()
        .map(|a| a.responded_by.clone())
        .unwrap_or_default();
    match question.answer.as_ref().map(|a| a.response_type) {
        Some(ResponseType::Approved) => json!({
            "question": question.prompt, "resolution": "accepted", "answer": assumption, "by": by
        }),
        Some(ResponseType::Rejected) => json!({
            "question": question.prompt, "resolution": "corrected",
            "answer": answer_text(question.answer.as_ref()), "by": by
        }),
        Some(ResponseType::OptionSelected) => {
            let selected = question
                .answer
                .as_ref()
                .and_then(|a| a.selected_option.clone())
                .unwrap_or_default();
            let label = option_label(&question.options, &selected).unwrap_or_else(|| selected.clone());
            json!({
                "question": question.prompt, "resolution": "option", "option": selected,
                "answer": label, "by": by
            })
        }
        Some(ResponseType::CustomText) => json!({
            "question": question.prompt, "resolution": "answered",
            "answer": answer_text(question.answer.as_ref()), "by": by
        }),
        // Timed out or released: proceed on the stated assumption.
        Some(ResponseType::Timeout) | None => json!({
            "question": question.prompt, "resolution": "assumed", "answer": assumption
        }),
    }
}

fn answer_text(answer: Option<&SignalPayload>) -> String {
    answer
        .and_then(|a| a.custom_text.clone())
        .unwrap_or_else(|| NO_REASON.to_string())
}

fn option_label(options: &[QuestionOption], id: &str) -> Option<String> {
    options
        .iter()
        .find(|o| o.id.eq_ignore_ascii_case(id))
        .map(|o| o.label.clone())
}

/// Options from a generation output: `[{"id": "A", "label": "..."}]`.
pub fn parse_options(value: Option<&Value>) -> Vec<QuestionOption> {
    value
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .enumerate()
                .filter_map(|(i, o)| {
                    let label = o.get("label").and_then(Value::as_str)?;
                    let id = o
                        .get("id")
                        .and_then(Value::as_str)
                        .map(|s| s.to_uppercase())
                        .unwrap_or_else(|| option_id(i));
                    Some(QuestionOption {
                        id,
                        label: label.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn option_id(index: usize) -> String {
    char::from(b'A' + (index % 26) as u8).to_string()
}

/// Let a human pick one of the proposed solutions. A timeout falls back to
/// the first option; rejecting every option fails the phase.
pub struct ChooseSolution {
    pub source: &'static str,
    pub policy: StepPolicy,
}

impl ChooseSolution {
    pub fn new(source: &'static str, settings: &PipelineSection) -> Self {
        Self {
            source,
            policy: StepPolicy::quick(settings).untimed(),
        }
    }
}

#[async_trait]
impl Step for ChooseSolution {
    fn name(&self) -> &str {
        "choose_solution"
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs.get(self.source).cloned().unwrap_or(Value::Null)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let options = parse_options(ctx.input.get("options"));
        let Some(first) = options.first().cloned() else {
            return Err(StepError::fatal("No solution options were proposed"));
        };
        if options.len() == 1 {
            return Ok(StepOutcome::Done(json!({ "choice": first, "decidedBy": "default" })));
        }

        let prompt = ctx
            .input
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("Which approach should we take?")
            .to_string();
        let spec = QuestionSpec {
            kind: QuestionKind::SolutionChoice,
            prompt,
            options: options.clone(),
        };
        let questions = match ctx
            .services
            .broker
            .ask(&ctx.run, &ctx.step_name, std::slice::from_ref(&spec))
            .await
            .map_err(|e| StepError::Collaborator(e.into()))?
        {
            AskOutcome::Waiting(ids) => return Ok(StepOutcome::Suspend { questions: ids }),
            AskOutcome::Resolved(questions) => questions,
        };

        let answer = questions.first().and_then(|q| q.answer.clone());
        match answer.as_ref().map(|a| a.response_type) {
            Some(ResponseType::OptionSelected) => {
                let selected = answer
                    .as_ref()
                    .and_then(|a| a.selected_option.clone())
                    .unwrap_or_default();
                let Some(choice) = options.iter().find(|o| o.id.eq_ignore_ascii_case(&selected)) else {
                    return Err(StepError::fatal(format!("Unknown option '{}' selected", selected)));
                };
                Ok(StepOutcome::Done(json!({
                    "choice": choice,
                    "decidedBy": answer.map(|a| a.responded_by).unwrap_or_default(),
                })))
            }
            Some(ResponseType::Rejected) => Err(StepError::fatal(format!(
                "All solution options rejected: {}",
                answer_text(answer.as_ref())
            ))),
            // Timed out, or approved without picking: go with the first option.
            _ => Ok(StepOutcome::Done(json!({ "choice": first, "decidedBy": "default" }))),
        }
    }
}

/// Ask for sign-off on an artefact. Only `APPROVE` approves. Rejection or any
/// other answer fails the phase; a timeout lets the phase continue unapproved.
pub struct Approval {
    pub name: &'static str,
    pub subject: &'static str,
    pub what: &'static str,
    pub policy: StepPolicy,
}

impl Approval {
    pub fn new(
        name: &'static str,
        subject: &'static str,
        what: &'static str,
        feature: Feature,
        settings: &PipelineSection,
    ) -> Self {
        Self {
            name,
            subject,
            what,
            policy: StepPolicy::quick(settings).untimed().when(feature),
        }
    }
}

#[async_trait]
impl Step for Approval {
    fn name(&self) -> &str {
        self.name
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs.get(self.subject).cloned().unwrap_or(Value::Null)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let summary = summary_of(&ctx.input).unwrap_or("(no summary)");
        let spec = QuestionSpec {
            kind: QuestionKind::Approval,
            prompt: format!("Please review the {} for {}:\n\n{}", self.what, ctx.item.identifier, summary),
            options: Vec::new(),
        };
        let questions = match ctx
            .services
            .broker
            .ask(&ctx.run, &ctx.step_name, std::slice::from_ref(&spec))
            .await
            .map_err(|e| StepError::Collaborator(e.into()))?
        {
            AskOutcome::Waiting(ids) => return Ok(StepOutcome::Suspend { questions: ids }),
            AskOutcome::Resolved(questions) => questions,
        };

        let answer = questions.first().and_then(|q| q.answer.clone());
        match answer.as_ref().map(|a| a.response_type) {
            Some(ResponseType::Rejected) => Err(StepError::fatal(format!(
                "The {} was rejected by {}: {}",
                self.what,
                answer.as_ref().map(|a| a.responded_by.as_str()).unwrap_or("reviewer"),
                answer_text(answer.as_ref())
            ))),
            Some(ResponseType::Timeout) | None => {
                tracing::warn!(run_id = %ctx.run.id, step = self.name, "approval timed out, continuing unapproved");
                Ok(StepOutcome::Done(json!({ "approved": false, "timedOut": true })))
            }
            Some(ResponseType::Approved) => Ok(StepOutcome::Done(json!({
                "approved": true,
                "by": answer.map(|a| a.responded_by).unwrap_or_default(),
            }))),
            // Only an explicit APPROVE signs off.
            Some(other) => Err(StepError::fatal(format!(
                "The {} was not approved: expected APPROVE or REJECT, got {}",
                self.what,
                other.as_str()
            ))),
        }
    }
}

/// Short human-readable summary of a generation output.
fn summary_of(output: &Value) -> Option<&str> {
    ["summary", "description", "document"]
        .iter()
        .find_map(|field| output.get(*field).and_then(Value::as_str))
}

/// Replace the tracker description with a generated one.
pub struct UpdateDescription {
    pub source: &'static str,
    pub policy: StepPolicy,
}

impl UpdateDescription {
    pub fn new(source: &'static str, settings: &PipelineSection) -> Self {
        Self {
            source,
            policy: StepPolicy::quick(settings),
        }
    }
}

#[async_trait]
impl Step for UpdateDescription {
    fn name(&self) -> &str {
        "update_description"
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs.get(self.source).cloned().unwrap_or(Value::Null)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let Some(description) = ctx.input.get("description").and_then(Value::as_str) else {
            return Err(StepError::fatal(format!("'{}' produced no description", self.source)));
        };
        ctx.services
            .collab
            .tracker
            .update_description(&ctx.item.id, description)
            .await?;
        Ok(StepOutcome::Done(json!({ "chars": description.len() })))
    }
}

/// Persist a generated artefact in the document store.
pub struct SaveDocument {
    pub name: &'static str,
    pub source: &'static str,
    pub kind: DocumentKind,
    pub policy: StepPolicy,
}

impl SaveDocument {
    pub fn new(name: &'static str, source: &'static str, kind: DocumentKind, settings: &PipelineSection) -> Self {
        Self {
            name,
            source,
            kind,
            policy: StepPolicy::quick(settings)
                .non_blocking()
                .when(Feature::ContextDocuments),
        }
    }
}

#[async_trait]
impl Step for SaveDocument {
    fn name(&self) -> &str {
        self.name
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs.get(self.source).cloned().unwrap_or(Value::Null)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let content = match ctx.input.get("document").and_then(Value::as_str) {
            Some(document) => document.to_string(),
            None => serde_json::to_string_pretty(&ctx.input)
                .map_err(|e| StepError::fatal(format!("Unserialisable output: {}", e)))?,
        };
        let location = ctx
            .services
            .collab
            .documents
            .save(&ctx.item, self.kind, &content)
            .await?;
        Ok(StepOutcome::Done(json!({ "location": location })))
    }
}

/// Label the item with its phase plus any labels a generation suggested.
pub struct ApplyLabels {
    pub phase: Phase,
    pub source: &'static str,
    pub policy: StepPolicy,
}

impl ApplyLabels {
    pub fn new(phase: Phase, source: &'static str, settings: &PipelineSection) -> Self {
        Self {
            phase,
            source,
            policy: StepPolicy::quick(settings)
                .non_blocking()
                .when(Feature::Labels),
        }
    }
}

#[async_trait]
impl Step for ApplyLabels {
    fn name(&self) -> &str {
        "apply_labels"
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs
            .get(self.source)
            .and_then(|o| o.get("labels"))
            .cloned()
            .unwrap_or(Value::Null)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let mut labels = vec![format!("forgeflow:{}", self.phase.as_str())];
        if let Some(suggested) = ctx.input.as_array() {
            labels.extend(
                suggested
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .filter(|l| !l.is_empty()),
            );
        }
        let mut seen = HashSet::new();
        labels.retain(|l| seen.insert(l.clone()));
        ctx.services
            .collab
            .tracker
            .add_labels(&ctx.item.id, &labels)
            .await?;
        Ok(StepOutcome::Done(json!({ "labels": labels })))
    }
}

/// Post a summary comment of a generated artefact.
pub struct PostSummary {
    pub name: &'static str,
    pub source: &'static str,
    pub heading: &'static str,
    pub policy: StepPolicy,
}

impl PostSummary {
    pub fn new(name: &'static str, source: &'static str, heading: &'static str, settings: &PipelineSection) -> Self {
        Self {
            name,
            source,
            heading,
            policy: StepPolicy::quick(settings)
                .non_blocking()
                .when(Feature::StatusComments),
        }
    }
}

#[async_trait]
impl Step for PostSummary {
    fn name(&self) -> &str {
        self.name
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs.get(self.source).cloned().unwrap_or(Value::Null)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let summary = summary_of(&ctx.input).unwrap_or("Completed.");
        let body = format!("**{}**\n\n{}", self.heading, summary);
        let comment_id = ctx
            .services
            .collab
            .tracker
            .post_comment(&ctx.item.id, &body, None)
            .await?;
        Ok(StepOutcome::Done(json!({ "commentId": comment_id })))
    }
}

/// Publish generated code changes as a pull request.
pub struct OpenPullRequest {
    pub source: &'static str,
    pub policy: StepPolicy,
}

impl OpenPullRequest {
    pub fn new(source: &'static str, settings: &PipelineSection) -> Self {
        Self {
            source,
            policy: StepPolicy::quick(settings).when(Feature::PullRequests),
        }
    }
}

#[async_trait]
impl Step for OpenPullRequest {
    fn name(&self) -> &str {
        "open_pull_request"
    }

    fn policy(&self) -> StepPolicy {
        self.policy.clone()
    }

    fn input(&self, outputs: &StepOutputs) -> Value {
        outputs.get(self.source).cloned().unwrap_or(Value::Null)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let url = ctx
            .services
            .collab
            .source_control
            .open_pull_request(&ctx.item, &ctx.input)
            .await?;
        Ok(StepOutcome::Done(json!({ "url": url })))
    }
}
