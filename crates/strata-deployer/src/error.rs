//! Deployer error types.

use thiserror::Error;

use strata_engine::{SubstrateError, TemplateError};

use crate::pipeline::Stage;

/// Errors that can occur while running a deployment pipeline.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Recoverable failure — retried with backoff up to the attempt limit.
    #[error("transient provisioning error: {0}")]
    Provisioning(String),

    /// Permanent failure — never retried, deployment moves to Failed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A single stage exceeded its timeout (treated as transient).
    #[error("stage {0:?} timed out")]
    StageTimeout(Stage),

    /// The aggregate pipeline deadline was exceeded; rollback is forced.
    #[error("pipeline deadline exceeded")]
    PipelineTimeout,

    /// No node can fit the requested resources.
    #[error("no eligible node with capacity for the requested resources")]
    NoCapacity,

    /// The caller cancelled the pipeline; rollback was performed.
    #[error("cancelled")]
    Cancelled,

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(#[from] strata_state::StateError),
}

impl DeployError {
    /// Whether the error is worth retrying within a stage.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provisioning(_) | Self::StageTimeout(_))
    }
}

impl From<SubstrateError> for DeployError {
    fn from(e: SubstrateError) -> Self {
        match e {
            SubstrateError::Transient(msg) => Self::Provisioning(msg),
            SubstrateError::Permanent(msg) => Self::Configuration(msg),
            SubstrateError::UnknownHandle(h) => {
                Self::Configuration(format!("unknown substrate handle {h}"))
            }
        }
    }
}

impl From<TemplateError> for DeployError {
    fn from(e: TemplateError) -> Self {
        Self::Configuration(e.to_string())
    }
}

pub type DeployResult<T> = Result<T, DeployError>;
