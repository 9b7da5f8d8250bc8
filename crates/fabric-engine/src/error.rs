//! Engine error types.

use fabric_core::JobId;
use fabric_placement::PlanError;
use fabric_state::{EntityRef, StateError};
use thiserror::Error;

use crate::engine::PlanPhase;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job {job_id} is infeasible: {reason}")]
    Infeasible { job_id: JobId, reason: String },

    /// Commit failed and nothing the plan relied on had changed.
    #[error("job {job_id} failed to commit: {reason}")]
    PartialInfeasible {
        job_id: JobId,
        entity: Option<EntityRef>,
        reason: String,
    },

    /// Commit failed because the fabric changed after the plan's snapshot.
    #[error("snapshot {snapshot_version} is stale for job {job_id}: {reason}")]
    StaleSnapshot {
        job_id: JobId,
        snapshot_version: u64,
        entity: Option<EntityRef>,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid override {event_id}: {reason}")]
    InvalidOverride { event_id: String, reason: String },

    #[error("plan request for job {0} was cancelled")]
    Cancelled(JobId),

    #[error("no snapshot archive configured")]
    NoArchive,

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    State(StateError),
}

impl EngineError {
    /// Re-planning from a fresh snapshot may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StaleSnapshot { .. })
    }

    /// Terminal plan-request phase this error corresponds to, if any.
    pub fn phase(&self) -> Option<PlanPhase> {
        match self {
            EngineError::Infeasible { .. } | EngineError::PartialInfeasible { .. } => {
                Some(PlanPhase::Infeasible)
            }
            EngineError::StaleSnapshot { .. } => Some(PlanPhase::StaleSnapshot),
            _ => None,
        }
    }

    /// Node a commit failure points at, for strategy feedback.
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            EngineError::PartialInfeasible { entity, .. }
            | EngineError::StaleSnapshot { entity, .. } => match entity {
                Some(EntityRef::Node(node)) => Some(node),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => EngineError::NotFound(what),
            StateError::InvalidOverride { event_id, reason } => {
                EngineError::InvalidOverride { event_id, reason }
            }
            other => EngineError::State(other),
        }
    }
}
