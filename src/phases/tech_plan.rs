use std::sync::Arc;

use super::PhaseOrchestrator;
use super::steps::*;
use crate::collab::{DocumentKind, GenerationTask};
use crate::config::{Feature, PipelineSection};
use crate::pipeline::Step;
use crate::status::{Phase, Stage};

/// Technical planning: propose approaches, let a human choose one, then plan
/// it in detail.
pub struct TechPlanOrchestrator;

impl PhaseOrchestrator for TechPlanOrchestrator {
    fn phase(&self) -> Phase {
        Phase::TechnicalPlan
    }

    fn steps(&self, settings: &PipelineSection) -> Vec<Arc<dyn Step>> {
        let phase = self.phase();
        vec![
            Arc::new(SetStatus::new("mark_in_progress", phase, Stage::InProgress, settings)),
            Arc::new(RetrieveContext::new(phase, settings)),
            Arc::new(Generate::new(
                "propose_solutions",
                GenerationTask::SolutionOptions,
                &["retrieve_context"],
                &["options"],
                settings,
            )),
            Arc::new(ChooseSolution::new("propose_solutions", settings)),
            Arc::new(Generate::new(
                "write_plan",
                GenerationTask::TechnicalPlan,
                &["retrieve_context", "choose_solution"],
                &["document"],
                settings,
            )),
            Arc::new(Approval::new(
                "approve_plan",
                "write_plan",
                "technical plan",
                Feature::PlanApproval,
                settings,
            )),
            Arc::new(SaveDocument::new(
                "save_plan_doc",
                "write_plan",
                DocumentKind::TechnicalPlan,
                settings,
            )),
            Arc::new(ApplyLabels::new(phase, "write_plan", settings)),
            Arc::new(PostSummary::new("post_plan", "write_plan", "Technical plan ready", settings)),
            Arc::new(SetStatus::new("mark_ready", phase, Stage::Ready, settings)),
        ]
    }
}
