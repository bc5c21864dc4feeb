use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::StepContext;
use crate::config::{Feature, PipelineSection};
use crate::errors::StepError;

/// Whether a failed step fails the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The run fails and the item moves to its phase's failure status.
    Blocking,
    /// The failure is recorded and the run continues.
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepPolicy {
    /// Per-attempt limit. `None` lets the attempt run to completion.
    pub timeout: Option<Duration>,
    /// Extra attempts after a retryable error.
    pub retries: u32,
    pub failure: FailureClass,
    /// When set, the step only runs while this feature is enabled.
    pub flag: Option<Feature>,
}

impl StepPolicy {
    /// Status writes, comments, labels and other quick tracker calls.
    pub fn quick(settings: &PipelineSection) -> Self {
        Self {
            timeout: Some(settings.step_timeout()),
            retries: settings.max_retries,
            failure: FailureClass::Blocking,
            flag: None,
        }
    }

    /// AI generation calls.
    pub fn generation(settings: &PipelineSection) -> Self {
        Self {
            timeout: Some(settings.generation_timeout()),
            ..Self::quick(settings)
        }
    }

    /// For steps that post questions. An attempt cut off after the tracker
    /// accepted a comment, but before it was recorded, posts it twice.
    pub fn untimed(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.failure = FailureClass::NonBlocking;
        self
    }

    pub fn when(mut self, feature: Feature) -> Self {
        self.flag = Some(feature);
        self
    }
}

/// What a successful step execution produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Finished with a JSON output later steps can read by step name.
    Done(Value),
    /// Waiting on the listed questions. Not a failure; the step runs again
    /// when the run resumes.
    Suspend { questions: Vec<String> },
}

/// Outputs of the steps completed so far, keyed by step name.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    outputs: BTreeMap<String, Value>,
}

impl StepOutputs {
    pub fn insert(&mut self, name: &str, output: Value) {
        self.outputs.insert(name.to_string(), output);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).filter(|v| !v.is_null())
    }

    /// `{name: output}` for the named steps that produced something.
    pub fn select(&self, names: &[&str]) -> Value {
        let mut map = Map::new();
        for name in names {
            if let Some(value) = self.get(name) {
                map.insert(name.to_string(), value.clone());
            }
        }
        Value::Object(map)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// One named unit of work in a phase pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> StepPolicy;

    /// Input transform over prior outputs. Defaults to nothing.
    fn input(&self, _outputs: &StepOutputs) -> Value {
        Value::Null
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError>;
}
