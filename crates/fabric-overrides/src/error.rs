//! Error types for the override merger.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type MergerResult<T> = Result<T, MergerError>;

#[derive(Debug, Error)]
pub enum MergerError {
    #[error("override log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("override log read timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    State(#[from] fabric_state::StateError),

    #[error("merger task failed: {0}")]
    Join(String),
}
