//! Pipeline error taxonomy.
//!
//! Advisory failures (goal validation, the calendar conflict check) degrade
//! gracefully and never block task creation; the rest propagate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Idempotency hit. Not a failure: the caller acknowledges the delivery
    /// exactly as it would a fresh message.
    #[error("message {0} was already recorded")]
    DuplicateMessage(String),

    /// Goal validation infrastructure failed. Fails open with a neutral
    /// score.
    #[error("validation service failed: {0}")]
    ValidationService(String),

    /// Conflict check against the calendar cache failed. Logged; the task
    /// is created without a conflict warning.
    #[error("conflict check failed: {0}")]
    ConflictCheck(String),

    /// A job burned through its retry budget.
    #[error("job exhausted retries: {0}")]
    JobExhausted(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the failure is advisory: callers fall back per component
    /// instead of aborting the primary action.
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            PipelineError::ValidationService(_) | PipelineError::ConflictCheck(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_errors_are_flagged() {
        assert!(PipelineError::ConflictCheck("x".into()).is_advisory());
        assert!(PipelineError::ValidationService("x".into()).is_advisory());
        assert!(!PipelineError::DuplicateMessage("sid".into()).is_advisory());
        assert!(!PipelineError::JobExhausted("sid".into()).is_advisory());
    }
}
