//! Step pipeline executor.
//!
//! A phase is an ordered list of `Step`s. The executor runs them for one run
//! under each step's policy (timeout, retries, failure class, feature flag),
//! journals every result, and resumes from the journal so completed steps
//! never execute twice.

mod context;
mod executor;
mod step;

pub use context::{Services, StepContext};
pub use executor::{PipelineOutcome, RunJournal, StepExecutor};
pub use step::{FailureClass, Step, StepOutcome, StepOutputs, StepPolicy};
