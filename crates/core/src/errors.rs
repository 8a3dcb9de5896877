use thiserror::Error;

use crate::budget::BudgetLimit;
use crate::domain::job::{JobId, JobState};
use crate::remote::RemoteError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("budget exceeded ({limit}): {reason}")]
    BudgetExceeded { limit: BudgetLimit, reason: String },
    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(#[from] RemoteError),
    /// Submission failed remotely; the `Failed` record stays queryable under `job_id`.
    #[error("remote service unavailable: {error} (failed job recorded as {job_id})")]
    SubmissionFailed { job_id: JobId, error: RemoteError },
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("job {job_id} is still {state}; poll until it completes")]
    JobNotTerminal { job_id: JobId, state: JobState },
    #[error("job {job_id} ended as {state}; it has no results")]
    JobNotCompleted { job_id: JobId, state: JobState },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("export failed: {0}")]
    Export(String),
}

impl GatewayError {
    /// Stable, machine-readable class for adapters and logs.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::RemoteUnavailable(_) | Self::SubmissionFailed { .. } => "remote_unavailable",
            Self::JobNotFound(_) => "job_not_found",
            Self::JobNotTerminal { .. } => "job_not_terminal",
            Self::JobNotCompleted { .. } => "job_not_completed",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::Export(_) => "export_failed",
        }
    }

    /// Whether the same request may succeed later without the caller changing it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable(_) | Self::SubmissionFailed { .. } | Self::JobNotTerminal { .. }
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
