use std::sync::Arc;

use super::PhaseOrchestrator;
use super::steps::*;
use crate::collab::{DocumentKind, GenerationTask};
use crate::config::{Feature, PipelineSection};
use crate::pipeline::Step;
use crate::status::{Phase, Stage};

pub struct CodegenOrchestrator;

impl PhaseOrchestrator for CodegenOrchestrator {
    fn phase(&self) -> Phase {
        Phase::CodeGeneration
    }

    fn steps(&self, settings: &PipelineSection) -> Vec<Arc<dyn Step>> {
        let phase = self.phase();
        vec![
            Arc::new(SetStatus::new("mark_in_progress", phase, Stage::InProgress, settings)),
            Arc::new(RetrieveContext::new(phase, settings)),
            Arc::new(Generate::new(
                "generate_code",
                GenerationTask::CodeChanges,
                &["retrieve_context"],
                &["files"],
                settings,
            )),
            Arc::new(Approval::new(
                "approve_code",
                "generate_code",
                "generated code",
                Feature::CodeApproval,
                settings,
            )),
            Arc::new(OpenPullRequest::new("generate_code", settings)),
            Arc::new(SaveDocument::new(
                "save_changes_doc",
                "generate_code",
                DocumentKind::CodeChanges,
                settings,
            )),
            Arc::new(PostSummary::new("post_code_summary", "generate_code", "Code generated", settings)),
            Arc::new(SetStatus::new("mark_ready", phase, Stage::Ready, settings)),
        ]
    }
}
