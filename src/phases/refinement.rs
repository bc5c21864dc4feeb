use std::sync::Arc;

use super::PhaseOrchestrator;
use super::steps::*;
use crate::collab::{DocumentKind, GenerationTask};
use crate::config::PipelineSection;
use crate::pipeline::Step;
use crate::status::{Phase, Stage};

/// Refinement: analyse the issue, clarify open points with a human, and
/// rewrite the description.
pub struct RefinementOrchestrator;

impl PhaseOrchestrator for RefinementOrchestrator {
    fn phase(&self) -> Phase {
        Phase::Refinement
    }

    fn steps(&self, settings: &PipelineSection) -> Vec<Arc<dyn Step>> {
        let phase = self.phase();
        vec![
            Arc::new(SetStatus::new("mark_in_progress", phase, Stage::InProgress, settings)),
            Arc::new(RetrieveContext::new(phase, settings)),
            Arc::new(Generate::new(
                "analyze_requirements",
                GenerationTask::RefinementAnalysis,
                &["retrieve_context"],
                &["summary"],
                settings,
            )),
            Arc::new(Clarify::new("analyze_requirements", settings)),
            Arc::new(Generate::new(
                "write_refinement",
                GenerationTask::RefinedDescription,
                &["analyze_requirements", "clarify"],
                &["description"],
                settings,
            )),
            Arc::new(UpdateDescription::new("write_refinement", settings)),
            Arc::new(SaveDocument::new(
                "save_refinement_doc",
                "write_refinement",
                DocumentKind::Refinement,
                settings,
            )),
            Arc::new(ApplyLabels::new(phase, "analyze_requirements", settings)),
            Arc::new(SetStatus::new("mark_ready", phase, Stage::Ready, settings)),
        ]
    }
}
