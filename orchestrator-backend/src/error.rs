//! Error taxonomy for the orchestration core.
//!
//! Storage errors bubble up from rusqlite; everything else is raised by the
//! scheduler, the runner, or the tenant guard.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Cron expression or timezone rejected at the API boundary
    #[error("Invalid schedule expression: {0}")]
    InvalidScheduleExpression(String),

    /// Another tick already holds the running execution for this job
    #[error("Job {0} is already claimed by a running execution")]
    ClaimConflict(i64),

    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    #[error("Agent loop error: {0}")]
    ExternalLoop(String),

    #[error("Tenant violation: user '{requester}' may not access data owned by '{target}'")]
    TenantViolation { requester: String, target: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Whether this error is a constraint violation on an insert/update.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Storage(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
