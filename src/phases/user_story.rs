use std::sync::Arc;

use super::PhaseOrchestrator;
use super::steps::*;
use crate::collab::{DocumentKind, GenerationTask};
use crate::config::{Feature, PipelineSection};
use crate::pipeline::Step;
use crate::status::{Phase, Stage};

pub struct UserStoryOrchestrator;

impl PhaseOrchestrator for UserStoryOrchestrator {
    fn phase(&self) -> Phase {
        Phase::UserStory
    }

    fn steps(&self, settings: &PipelineSection) -> Vec<Arc<dyn Step>> {
        let phase = self.phase();
        vec![
            Arc::new(SetStatus::new("mark_in_progress", phase, Stage::InProgress, settings)),
            Arc::new(RetrieveContext::new(phase, settings)),
            Arc::new(Generate::new(
                "write_stories",
                GenerationTask::UserStories,
                &["retrieve_context"],
                &["stories"],
                settings,
            )),
            Arc::new(Approval::new(
                "approve_stories",
                "write_stories",
                "user stories",
                Feature::StoryApproval,
                settings,
            )),
            Arc::new(SaveDocument::new(
                "save_stories_doc",
                "write_stories",
                DocumentKind::UserStories,
                settings,
            )),
            Arc::new(PostSummary::new("post_stories", "write_stories", "User stories written", settings)),
            Arc::new(SetStatus::new("mark_ready", phase, Stage::Ready, settings)),
        ]
    }
}
