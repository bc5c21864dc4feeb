//! The four phase orchestrators and the failure boundary around them.
//!
//! Each orchestrator is a fixed step sequence; optional steps carry their own
//! feature flag. `run_phase` is the only place a blocking failure turns into
//! the "<phase> Failed" status.

mod codegen;
mod refinement;
pub mod steps;
mod tech_plan;
mod user_story;

pub use codegen::CodegenOrchestrator;
pub use refinement::RefinementOrchestrator;
pub use tech_plan::TechPlanOrchestrator;
pub use user_story::UserStoryOrchestrator;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PipelineSection;
use crate::errors::PhaseError;
use crate::models::{RunRecord, RunState, WorkItem};
use crate::pipeline::{PipelineOutcome, Services, Step, StepExecutor};
use crate::status::{Phase, Stage};

pub trait PhaseOrchestrator: Send + Sync {
    fn phase(&self) -> Phase;

    fn steps(&self, settings: &PipelineSection) -> Vec<Arc<dyn Step>>;
}

/// Orchestrators by phase.
#[derive(Clone)]
pub struct PhaseRegistry {
    orchestrators: HashMap<Phase, Arc<dyn PhaseOrchestrator>>,
}

impl PhaseRegistry {
    pub fn empty() -> Self {
        Self {
            orchestrators: HashMap::new(),
        }
    }

    /// All four built-in phases.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RefinementOrchestrator));
        registry.register(Arc::new(UserStoryOrchestrator));
        registry.register(Arc::new(TechPlanOrchestrator));
        registry.register(Arc::new(CodegenOrchestrator));
        registry
    }

    pub fn register(&mut self, orchestrator: Arc<dyn PhaseOrchestrator>) {
        self.orchestrators.insert(orchestrator.phase(), orchestrator);
    }

    pub fn get(&self, phase: Phase) -> Result<Arc<dyn PhaseOrchestrator>, PhaseError> {
        self.orchestrators
            .get(&phase)
            .cloned()
            .ok_or(PhaseError::UnknownPhase(phase))
    }
}

/// Run one pass of a phase pipeline.
///
/// A blocking step failure moves the item to the phase failure status, marks
/// the run failed, and comes back as `PhaseError::StepFailed`. Every other
/// outcome is returned for the runtime to act on.
pub async fn run_phase(
    executor: &StepExecutor,
    orchestrator: &dyn PhaseOrchestrator,
    run: &RunRecord,
    item: &WorkItem,
    services: &Arc<Services>,
) -> Result<PipelineOutcome, PhaseError> {
    let phase = orchestrator.phase();
    let steps = orchestrator.steps(&services.pipeline);
    let outcome = executor.run(&steps, run, item, services).await?;

    let PipelineOutcome::Failed { step, error } = outcome else {
        return Ok(outcome);
    };

    match services.table.status_for(phase, Stage::Failed) {
        Some(entry) => {
            if let Err(e) = services.status.set(&item.id, &entry.name).await {
                tracing::error!(run_id = %run.id, item_id = %item.id, error = %e, "failed to set failure status");
            }
        }
        None => tracing::warn!(phase = %phase, "no failure status configured"),
    }

    let (run_id, message) = (run.id.clone(), format!("{}: {}", step, error));
    services
        .db
        .call(move |db| {
            db.transition_run(&run_id, &[RunState::Running], RunState::Failed, Some(&message))
        })
        .await?;

    Err(PhaseError::StepFailed {
        run_id: run.id.clone(),
        phase,
        step,
        message: error,
    })
}
