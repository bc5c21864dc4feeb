use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::{GenerationRequest, GenerationTask, Generator};

const SYSTEM_PROMPT: &str = "You are a delivery assistant working on one tracker issue. \
Respond with a single JSON object and nothing else.";

/// Generator that shells out to an AI CLI in print mode.
pub struct CliGenerator {
    command: String,
    model: Option<String>,
    workdir: PathBuf,
}

impl CliGenerator {
    pub fn new(command: &str, model: Option<String>, workdir: &Path) -> Self {
        Self {
            command: command.to_string(),
            model,
            workdir: workdir.to_path_buf(),
        }
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(["--print", "--output-format", "text", "-p", prompt])
            .args(["--system", SYSTEM_PROMPT]);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }
        let output = cmd
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {} for generation", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Generator exited with {}: {}", output.status, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Generator for CliGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        let prompt = build_prompt(request);
        tracing::debug!(
            task = request.task.as_str(),
            item_id = %request.item.id,
            chars = prompt.len(),
            "invoking generator"
        );
        let response = self.call(&prompt).await?;
        let json = extract_json(&response)
            .with_context(|| format!("Generator returned no JSON for {}", request.task.as_str()))?;
        serde_json::from_str(json)
            .with_context(|| format!("Failed to parse {} output as JSON", request.task.as_str()))
    }
}

fn instructions(task: GenerationTask) -> &'static str {
    match task {
        GenerationTask::RefinementAnalysis => {
            "Analyse the issue for missing or ambiguous requirements. Return \
             {\"summary\": string, \"questions\": [{\"prompt\": string, \"assumption\": string, \
             \"options\": [{\"id\": string, \"label\": string}]}], \"labels\": [string]}."
        }
        GenerationTask::RefinedDescription => {
            "Rewrite the issue description using the analysis and the clarification answers. \
             Return {\"description\": string, \"document\": string}."
        }
        GenerationTask::UserStories => {
            "Write user stories with acceptance criteria for the refined issue. Return \
             {\"stories\": [{\"title\": string, \"story\": string, \"acceptance\": [string]}], \
             \"document\": string}."
        }
        GenerationTask::SolutionOptions => {
            "Propose two or three technical approaches. Return \
             {\"question\": string, \"options\": [{\"id\": string, \"label\": string}]}."
        }
        GenerationTask::TechnicalPlan => {
            "Write a technical plan for the chosen approach. Return \
             {\"summary\": string, \"document\": string, \"labels\": [string]}."
        }
        GenerationTask::CodeChanges => {
            "Produce the code changes that implement the plan. Return \
             {\"summary\": string, \"files\": [{\"path\": string, \"content\": string}], \
             \"document\": string}."
        }
    }
}

/// Assemble the prompt for one generation task.
pub fn build_prompt(request: &GenerationRequest) -> String {
    let input = serde_json::to_string_pretty(&request.input).unwrap_or_default();
    format!(
        "## Task\n{}\n\n## Issue {}\n### {}\n\n{}\n\n## Prior results\n```json\n{}\n```\n",
        instructions(request.task),
        request.item.identifier,
        request.item.title,
        if request.item.description.is_empty() {
            "No description provided."
        } else {
            request.item.description.as_str()
        },
        input
    )
}

/// Slice the outermost JSON object out of a response that may carry prose
/// or markdown fences around it.
pub fn extract_json(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}
