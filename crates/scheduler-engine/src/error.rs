use thiserror::Error;

/// Faults surfaced to callers of the scheduler API.
///
/// The transport collaborator maps these 1:1 onto HTTP statuses
/// (validation → 400, not-found → 404, internal → 500).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Missing/invalid input or an illegal state transition.
    #[error("{0}")]
    Validation(String),
    /// An operation referenced an unknown job or host.
    #[error("{0}")]
    NotFound(String),
    /// An unexpected condition; state stays consistent under the lock.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
