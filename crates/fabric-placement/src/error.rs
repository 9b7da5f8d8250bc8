//! Error types for planning.

use thiserror::Error;

/// Result type alias for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("policy state error: {0}")]
    PolicyState(String),
}
