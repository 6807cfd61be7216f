//! Orchestrator error types.

use thiserror::Error;

use strata_deployer::DeployError;
use strata_state::StateError;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The request is malformed or references state it cannot act on.
    /// Immediate, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The owner's quota would be exceeded. Immediate, never retried.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Another mutating operation holds the deployment's lock.
    #[error("operation in flight: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A backup execution failed. Marks the backup record only; the
    /// deployment is unaffected.
    #[error("backup failure: {0}")]
    BackupFailure(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Deploy(#[from] DeployError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
