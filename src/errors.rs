//! Typed error hierarchy for forgeflow.
//!
//! One enum per subsystem:
//! - `StepError`: a single step attempt inside the executor
//! - `PhaseError`: a phase run, raised at the orchestrator boundary
//! - `BrokerError`: question posting and answer delivery
//! - `RouteError`: trigger routing of inbound tracker events
//! - `StoreError`: persistence conflicts the callers branch on

use std::time::Duration;

use thiserror::Error;

use crate::status::Phase;

/// Errors from one attempt of a pipeline step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("step timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("run was cancelled")]
    Cancelled,

    /// Failures bubbling up from external collaborators are retried like
    /// transient errors.
    #[error("collaborator call failed: {0:#}")]
    Collaborator(#[from] anyhow::Error),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Whether the executor may attempt the step again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::Collaborator(_)
        )
    }
}

/// Errors from a phase run, surfaced after the failure status transition.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{phase} run {run_id} failed at step '{step}': {message}")]
    StepFailed {
        run_id: String,
        phase: Phase,
        step: String,
        message: String,
    },

    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("work item {item_id} not found for run {run_id}")]
    ItemNotFound { run_id: String, item_id: String },

    #[error("no orchestrator registered for phase {0}")]
    UnknownPhase(Phase),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the human signal broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to post question for item {item_id}: {message}")]
    PostFailed { item_id: String, message: String },

    #[error("question {id} not found")]
    QuestionNotFound { id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from routing an inbound tracker event.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("work item {id} not found")]
    ItemNotFound { id: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistence conflicts surfaced to callers through `anyhow`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a {phase} run is already active for item {item_id}")]
    RunAlreadyActive { item_id: String, phase: Phase },

    #[error("work item {id} not found")]
    ItemNotFound { id: String },

    #[error("run {id} not found")]
    RunNotFound { id: String },

    #[error("database lock poisoned")]
    LockPoisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_retry_classification() {
        assert!(StepError::transient("rate limited").is_retryable());
        assert!(StepError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(StepError::from(anyhow::anyhow!("connection reset")).is_retryable());
        assert!(!StepError::fatal("invalid output").is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }

    #[test]
    fn step_error_timeout_message_carries_seconds() {
        let err = StepError::Timeout(Duration::from_secs(90));
        assert!(err.to_string().contains("90s"));
    }

    #[test]
    fn phase_error_step_failed_names_phase_and_step() {
        let err = PhaseError::StepFailed {
            run_id: "refinement-item-1-1".into(),
            phase: Phase::Refinement,
            step: "analyze_requirements".into(),
            message: "model unavailable".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Refinement"));
        assert!(msg.contains("analyze_requirements"));
        assert!(msg.contains("model unavailable"));
    }

    #[test]
    fn route_error_converts_from_broker_error() {
        let inner = BrokerError::QuestionNotFound { id: "q-1".into() };
        let err: RouteError = inner.into();
        match &err {
            RouteError::Broker(BrokerError::QuestionNotFound { id }) => assert_eq!(id, "q-1"),
            _ => panic!("Expected RouteError::Broker(QuestionNotFound)"),
        }
    }

    #[test]
    fn store_error_is_recoverable_through_anyhow() {
        let err: anyhow::Error = StoreError::RunAlreadyActive {
            item_id: "item-1".into(),
            phase: Phase::UserStory,
        }
        .into();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::RunAlreadyActive { .. })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StepError::Cancelled);
        assert_std_error(&PhaseError::UnknownPhase(Phase::CodeGeneration));
        assert_std_error(&BrokerError::QuestionNotFound { id: "x".into() });
        assert_std_error(&RouteError::Malformed("x".into()));
        assert_std_error(&StoreError::LockPoisoned);
    }
}
