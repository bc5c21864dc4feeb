use std::sync::Arc;

use serde_json::Value;

use super::StepOutputs;
use crate::broker::HumanSignalBroker;
use crate::collab::Collaborators;
use crate::config::{FeatureFlags, PipelineSection};
use crate::db::DbHandle;
use crate::models::{RunRecord, WorkItem};
use crate::status::{StatusTable, StatusWriter};

/// Long-lived dependencies shared by every run, built once at the
/// composition root.
pub struct Services {
    pub db: DbHandle,
    pub table: Arc<StatusTable>,
    pub status: StatusWriter,
    pub collab: Collaborators,
    pub broker: HumanSignalBroker,
    pub flags: FeatureFlags,
    pub pipeline: PipelineSection,
}

/// Everything one step execution can see.
pub struct StepContext {
    pub run: RunRecord,
    pub item: WorkItem,
    pub step_name: String,
    /// Result of the step's input transform.
    pub input: Value,
    pub outputs: StepOutputs,
    pub services: Arc<Services>,
}
