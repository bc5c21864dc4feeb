use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{FailureClass, Services, Step, StepContext, StepOutcome, StepOutputs, StepPolicy};
use crate::db::DbHandle;
use crate::errors::StepError;
use crate::models::{RunRecord, RunState, StepResult, StepStatus, WorkItem};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How a pipeline run ended this time around.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed,
    /// Suspended on human questions. Not a failure.
    Blocked { step: String, questions: Vec<String> },
    Failed { step: String, error: String },
    Cancelled,
}

/// Durable record of step results for a run.
#[async_trait]
pub trait RunJournal: Send + Sync {
    async fn load(&self, run_id: &str) -> Result<Vec<StepResult>>;
    async fn append(&self, result: StepResult) -> Result<()>;
    async fn mark_position(&self, run_id: &str, index: usize) -> Result<()>;
    async fn is_cancelled(&self, run_id: &str) -> Result<bool>;
}

#[async_trait]
impl RunJournal for DbHandle {
    async fn load(&self, run_id: &str) -> Result<Vec<StepResult>> {
        let id = run_id.to_string();
        self.call(move |db| db.step_results(&id)).await
    }

    async fn append(&self, result: StepResult) -> Result<()> {
        self.call(move |db| db.append_step_result(&result)).await
    }

    async fn mark_position(&self, run_id: &str, index: usize) -> Result<()> {
        let id = run_id.to_string();
        self.call(move |db| db.set_current_step(&id, index)).await
    }

    async fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        let id = run_id.to_string();
        let run = self.call(move |db| db.get_run(&id)).await?;
        Ok(matches!(run, Some(r) if r.state == RunState::Cancelled))
    }
}

/// Runs an ordered step list for one run, resuming from its journal.
pub struct StepExecutor {
    journal: Arc<dyn RunJournal>,
    backoff: Duration,
}

impl StepExecutor {
    pub fn new(journal: Arc<dyn RunJournal>, backoff: Duration) -> Self {
        Self { journal, backoff }
    }

    pub async fn run(
        &self,
        steps: &[Arc<dyn Step>],
        run: &RunRecord,
        item: &WorkItem,
        services: &Arc<Services>,
    ) -> Result<PipelineOutcome> {
        let journal = self
            .journal
            .load(&run.id)
            .await
            .context("Failed to load run journal")?;
        if journal.len() > steps.len() {
            bail!(
                "Run {} has {} journal entries but only {} steps",
                run.id,
                journal.len(),
                steps.len()
            );
        }

        let mut outputs = StepOutputs::default();
        for (result, step) in journal.iter().zip(steps) {
            if result.name != step.name() {
                bail!(
                    "Run {} journal entry {} is '{}' but the pipeline has '{}'",
                    run.id,
                    result.index,
                    result.name,
                    step.name()
                );
            }
            outputs.insert(&result.name, result.output.clone());
        }
        if !journal.is_empty() {
            tracing::info!(run_id = %run.id, resumed_at = journal.len(), "resuming run from journal");
        }

        for (index, step) in steps.iter().enumerate().skip(journal.len()) {
            let name = step.name().to_string();
            if self.journal.is_cancelled(&run.id).await? {
                tracing::info!(run_id = %run.id, step = %name, "run cancelled before step");
                return Ok(PipelineOutcome::Cancelled);
            }
            self.journal.mark_position(&run.id, index).await?;

            let policy = step.policy();
            let started_at = Utc::now();

            if let Some(flag) = policy.flag
                && !services.flags.is_enabled(flag)
            {
                tracing::debug!(run_id = %run.id, step = %name, flag = flag.as_str(), "step disabled, skipping");
                self.record(run, index, &name, StepStatus::Skipped, started_at, None, Value::Null)
                    .await?;
                outputs.insert(&name, Value::Null);
                continue;
            }

            let ctx = StepContext {
                run: run.clone(),
                item: item.clone(),
                step_name: name.clone(),
                input: step.input(&outputs),
                outputs: outputs.clone(),
                services: services.clone(),
            };

            match self.attempt(step.as_ref(), &ctx, &policy).await {
                Ok(StepOutcome::Done(output)) => {
                    tracing::debug!(run_id = %run.id, step = %name, "step completed");
                    self.record(run, index, &name, StepStatus::Completed, started_at, None, output.clone())
                        .await?;
                    outputs.insert(&name, output);
                }
                Ok(StepOutcome::Suspend { questions }) => {
                    tracing::info!(run_id = %run.id, step = %name, questions = questions.len(), "step waiting on answers");
                    return Ok(PipelineOutcome::Blocked {
                        step: name,
                        questions,
                    });
                }
                Err(StepError::Cancelled) => return Ok(PipelineOutcome::Cancelled),
                Err(e) => {
                    let error = e.to_string();
                    self.record(run, index, &name, StepStatus::Failed, started_at, Some(error.clone()), Value::Null)
                        .await?;
                    match policy.failure {
                        FailureClass::Blocking => {
                            tracing::error!(run_id = %run.id, step = %name, error = %error, "blocking step failed");
                            return Ok(PipelineOutcome::Failed { step: name, error });
                        }
                        FailureClass::NonBlocking => {
                            tracing::warn!(run_id = %run.id, step = %name, error = %error, "non-blocking step failed, continuing");
                            outputs.insert(&name, Value::Null);
                        }
                    }
                }
            }
        }

        self.journal.mark_position(&run.id, steps.len()).await?;
        Ok(PipelineOutcome::Completed)
    }

    /// Execute a step under its timeout, if any, retrying retryable errors with
    /// exponential backoff.
    async fn attempt(
        &self,
        step: &dyn Step,
        ctx: &StepContext,
        policy: &StepPolicy,
    ) -> Result<StepOutcome, StepError> {
        let mut attempt = 0u32;
        loop {
            let result = match policy.timeout {
                Some(limit) => match tokio::time::timeout(limit, step.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::Timeout(limit)),
                },
                None => step.execute(ctx).await,
            };
            match result {
                Err(e) if e.is_retryable() && attempt < policy.retries => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        run_id = %ctx.run.id,
                        step = step.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        run: &RunRecord,
        index: usize,
        name: &str,
        status: StepStatus,
        started_at: chrono::DateTime<Utc>,
        error: Option<String>,
        output: Value,
    ) -> Result<()> {
        self.journal
            .append(StepResult {
                run_id: run.id.clone(),
                index,
                name: name.to_string(),
                status,
                started_at,
                finished_at: Utc::now(),
                error,
                output,
            })
            .await
            .context("Failed to journal step result")
    }
}
