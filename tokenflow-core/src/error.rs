use thiserror::Error;

/// Engine error taxonomy. Every fallible operation in the crate returns one
/// of these; expected alternatives (missing handler, absent execution) are
/// modeled as `Option` at the lookup site, never as errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Model or logic error. Fatal to the current command.
    #[error("process engine error: {0}")]
    ProcessEngine(String),

    /// Invalid input rejected before any state change.
    #[error("bad request: {0}")]
    BadUserRequest(String),

    /// Revision mismatch detected at flush time. Recoverable by retrying
    /// the whole command against fresh state.
    #[error("optimistic locking: {entity} {id} was updated concurrently")]
    OptimisticLocking { entity: &'static str, id: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} is suspended")]
    SuspendedEntity { entity: &'static str, id: String },
}

impl EngineError {
    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, EngineError::OptimisticLocking { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
