//! Local durable runtime for phase runs.
//!
//! Run state lives in the store: a run is `running` while a task drives it,
//! `blocked` while it waits on questions, and terminal afterwards. Tasks are
//! plain tokio tasks tracked in a map so they can be aborted. Suspension is
//! just the `blocked` row plus pending questions, so it survives restarts;
//! `recover` picks everything back up at startup.
//!
//! Resuming is always a compare-and-set `blocked → running`, so concurrent
//! answers, the sweeper and recovery can never resume one run twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::{PhaseError, StoreError};
use crate::models::{RunRecord, RunState, WorkItem, derive_run_id};
use crate::phases::{PhaseRegistry, run_phase};
use crate::pipeline::{PipelineOutcome, Services, StepExecutor};
use crate::status::Phase;

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(RunRecord),
    /// A run for this (item, phase) is already running or blocked.
    AlreadyActive { run_id: Option<String> },
}

/// Summary of one sweeper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub resumed: usize,
}

pub struct Runtime {
    services: Arc<Services>,
    registry: PhaseRegistry,
    executor: StepExecutor,
    live: DashMap<String, (u64, JoinHandle<()>)>,
    generation: AtomicU64,
    /// Item ids whose run just completed, for re-evaluation by the router.
    settled: Option<mpsc::UnboundedSender<String>>,
}

impl Runtime {
    pub fn new(
        services: Arc<Services>,
        registry: PhaseRegistry,
        settled: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        let executor = StepExecutor::new(
            Arc::new(services.db.clone()),
            services.pipeline.retry_backoff(),
        );
        Self {
            services,
            registry,
            executor,
            live: DashMap::new(),
            generation: AtomicU64::new(0),
            settled,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Start a run of `phase` for `item` unless one is already active.
    pub async fn start(self: &Arc<Self>, item: &WorkItem, phase: Phase) -> Result<StartOutcome> {
        self.registry.get(phase)?;
        let started_at = Utc::now();
        let run_id = derive_run_id(&item.id, phase, started_at);
        let (id, item_id) = (run_id.clone(), item.id.clone());
        let created = self
            .services
            .db
            .call(move |db| db.create_run(&id, &item_id, phase, started_at))
            .await;

        match created {
            Ok(run) => {
                tracing::info!(run_id = %run.id, item_id = %item.id, phase = %phase, "run started");
                self.spawn(run.id.clone());
                Ok(StartOutcome::Started(run))
            }
            Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::RunAlreadyActive { .. })) => {
                let item_id = item.id.clone();
                let existing = self
                    .services
                    .db
                    .call(move |db| db.active_run(&item_id, phase))
                    .await?;
                tracing::info!(item_id = %item.id, phase = %phase, "run already active, not starting another");
                Ok(StartOutcome::AlreadyActive {
                    run_id: existing.map(|r| r.id),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn spawn(self: &Arc<Self>, run_id: String) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        let id = run_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.drive(&id).await {
                tracing::error!(run_id = %id, error = %e, "run failed");
            }
            this.live.remove_if(&id, |_, (g, _)| *g == generation);
        });
        self.live.insert(run_id.clone(), (generation, handle));
        if self
            .live
            .get(&run_id)
            .is_some_and(|entry| entry.0 == generation && entry.1.is_finished())
        {
            self.live.remove_if(&run_id, |_, (g, _)| *g == generation);
        }
    }

    /// Drive a `running` run until it completes, blocks, fails or is cancelled.
    async fn drive(&self, run_id: &str) -> Result<(), PhaseError> {
        loop {
            let id = run_id.to_string();
            let run = self
                .services
                .db
                .call(move |db| db.get_run(&id))
                .await?
                .ok_or_else(|| PhaseError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;
            if run.state != RunState::Running {
                tracing::debug!(run_id, state = run.state.as_str(), "run not running, nothing to drive");
                return Ok(());
            }

            let item_id = run.item_id.clone();
            let item = self
                .services
                .db
                .call(move |db| db.get_item(&item_id))
                .await?
                .ok_or_else(|| PhaseError::ItemNotFound {
                    run_id: run.id.clone(),
                    item_id: run.item_id.clone(),
                })?;
            let orchestrator = self.registry.get(run.phase)?;

            let outcome = match run_phase(&self.executor, orchestrator.as_ref(), &run, &item, &self.services).await {
                Ok(outcome) => outcome,
                Err(e @ PhaseError::StepFailed { .. }) => return Err(e),
                Err(e) => {
                    let (id, message) = (run.id.clone(), e.to_string());
                    self.services
                        .db
                        .call(move |db| {
                            db.transition_run(&id, &[RunState::Running], RunState::Failed, Some(&message))
                        })
                        .await?;
                    return Err(e);
                }
            };

            match outcome {
                PipelineOutcome::Completed => {
                    let id = run.id.clone();
                    let finished = self
                        .services
                        .db
                        .call(move |db| db.transition_run(&id, &[RunState::Running], RunState::Completed, None))
                        .await?;
                    if finished {
                        tracing::info!(run_id = %run.id, item_id = %run.item_id, phase = %run.phase, "run completed");
                        self.notify_settled(&run.item_id);
                    }
                    return Ok(());
                }
                PipelineOutcome::Blocked { step, questions } => {
                    let id = run.id.clone();
                    let parked = self
                        .services
                        .db
                        .call(move |db| db.transition_run(&id, &[RunState::Running], RunState::Blocked, None))
                        .await?;
                    if !parked {
                        return Ok(());
                    }
                    tracing::info!(run_id = %run.id, step = %step, questions = questions.len(), "run blocked");

                    // Answers that landed before the run was parked found it
                    // still running and could not resume it.
                    if self.try_resume(&run.id).await? {
                        continue;
                    }
                    return Ok(());
                }
                PipelineOutcome::Cancelled => {
                    tracing::info!(run_id = %run.id, "run cancelled");
                    return Ok(());
                }
                PipelineOutcome::Failed { .. } => return Ok(()),
            }
        }
    }

    /// `blocked → running` when no question is pending. Returns whether this
    /// caller won the transition.
    async fn try_resume(&self, run_id: &str) -> Result<bool> {
        let id = run_id.to_string();
        self.services
            .db
            .call(move |db| {
                if db.pending_count_for_run(&id)? > 0 {
                    return Ok(false);
                }
                db.transition_run(&id, &[RunState::Blocked], RunState::Running, None)
            })
            .await
    }

    /// Resume a blocked run if all of its questions are resolved.
    pub async fn wake(self: &Arc<Self>, run_id: &str) -> Result<bool> {
        if self.try_resume(run_id).await? {
            tracing::info!(run_id, "run resumed");
            self.spawn(run_id.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Cancel a running or blocked run and release its questions.
    pub async fn cancel(&self, run_id: &str) -> Result<bool> {
        let id = run_id.to_string();
        let cancelled = self
            .services
            .db
            .call(move |db| {
                db.transition_run(
                    &id,
                    &[RunState::Running, RunState::Blocked],
                    RunState::Cancelled,
                    Some("cancelled"),
                )
            })
            .await?;
        if !cancelled {
            return Ok(false);
        }
        if let Some((_, (_, handle))) = self.live.remove(run_id) {
            handle.abort();
        }
        self.services.broker.release_for_run(run_id).await?;
        tracing::info!(run_id, "run cancelled");
        Ok(true)
    }

    /// Cancel every active run of an item. Returns the cancelled run ids.
    pub async fn cancel_item(&self, item_id: &str) -> Result<Vec<String>> {
        let id = item_id.to_string();
        let active = self
            .services
            .db
            .call(move |db| db.active_runs_for_item(&id))
            .await?;
        let mut cancelled = Vec::new();
        for run in active {
            if self.cancel(&run.id).await? {
                cancelled.push(run.id);
            }
        }
        Ok(cancelled)
    }

    /// Resume work after a restart: `running` runs are driven again and
    /// `blocked` runs resume if their questions were resolved meanwhile.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let running = self
            .services
            .db
            .call(|db| db.runs_in_state(RunState::Running))
            .await?;
        let mut resumed = 0;
        for run in running {
            if !self.live.contains_key(&run.id) {
                tracing::info!(run_id = %run.id, "recovering interrupted run");
                self.spawn(run.id);
                resumed += 1;
            }
        }
        resumed += self.resume_ready().await?;
        Ok(resumed)
    }

    /// Wake every blocked run with no pending questions.
    pub async fn resume_ready(self: &Arc<Self>) -> Result<usize> {
        let blocked = self
            .services
            .db
            .call(|db| db.runs_in_state(RunState::Blocked))
            .await?;
        let mut resumed = 0;
        for run in blocked {
            if self.wake(&run.id).await? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Expire overdue questions and resume whatever became unblocked.
    pub async fn sweep(self: &Arc<Self>, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired = self.services.broker.expire_overdue(now).await?;
        let resumed = self.resume_ready().await?;
        Ok(SweepReport {
            expired: expired.len(),
            resumed,
        })
    }

    /// Consume run ids signalled by the broker.
    pub fn spawn_signal_loop(self: &Arc<Self>, mut signals: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(run_id) = signals.recv().await {
                if let Err(e) = this.wake(&run_id).await {
                    tracing::error!(run_id = %run_id, error = %e, "failed to wake run");
                }
            }
        })
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match this.sweep(Utc::now()).await {
                    Ok(report) if report.expired > 0 || report.resumed > 0 => {
                        tracing::info!(expired = report.expired, resumed = report.resumed, "question sweep");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "question sweep failed"),
                }
            }
        })
    }

    /// Poll until the run leaves `running`, or the timeout passes.
    pub async fn wait_settled(&self, run_id: &str, timeout: Duration) -> Result<Option<RunRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let id = run_id.to_string();
            let run = self.services.db.call(move |db| db.get_run(&id)).await?;
            match run {
                Some(run) if run.state != RunState::Running => return Ok(Some(run)),
                None => return Ok(None),
                Some(run) if tokio::time::Instant::now() >= deadline => return Ok(Some(run)),
                Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    }

    pub fn live_runs(&self) -> usize {
        self.live.len()
    }

    fn notify_settled(&self, item_id: &str) {
        if let Some(tx) = &self.settled
            && tx.send(item_id.to_string()).is_err()
        {
            tracing::debug!(item_id, "settled channel closed");
        }
    }
}
