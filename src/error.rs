//! Error taxonomy for the pipeline.
//!
//! Executor and approval outcomes are recorded on invocations as
//! [`FailureKind`](crate::model::FailureKind); the variants here with the same
//! names are what callers see when such an outcome is surfaced as an error.

use thiserror::Error;

use crate::model::{ArtifactId, ExperimentId, InvocationId};
use crate::stage::StageKind;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("DuplicateActiveInvocation: experiment {experiment} already has a non-terminal {stage} invocation")]
    DuplicateActiveInvocation {
        experiment: ExperimentId,
        stage: StageKind,
    },

    #[error("InvalidTransition: {0}")]
    InvalidTransition(String),

    #[error("RejectedByApprover: {0}")]
    RejectedByApprover(String),

    #[error("ApprovalTimeout: {0}")]
    ApprovalTimeout(String),

    #[error("RetryableExecutorFailure: {0}")]
    RetryableExecutorFailure(String),

    #[error("FatalExecutorFailure: {0}")]
    FatalExecutorFailure(String),

    #[error("SanitizeRejected: {0}")]
    SanitizeRejected(String),

    #[error("CancellationRequested: {0}")]
    CancellationRequested(String),

    #[error("ArtifactNotFound: {0}")]
    ArtifactNotFound(ArtifactId),

    #[error("experiment not found: {0}")]
    ExperimentNotFound(ExperimentId),

    #[error("invocation not found: {0}")]
    InvocationNotFound(InvocationId),

    /// Optimistic update lost against a concurrent writer.
    #[error("concurrent modification of experiment {experiment} (expected version {expected})")]
    ConcurrentModification {
        experiment: ExperimentId,
        expected: i64,
    },

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A stored value could not be decoded.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    /// Process exit code for the command surface.
    ///
    /// 1 invalid arguments (and any failure without a more specific code),
    /// 2 not found, 3 invalid state transition.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::ExperimentNotFound(_)
            | PipelineError::InvocationNotFound(_)
            | PipelineError::ArtifactNotFound(_) => 2,
            PipelineError::DuplicateActiveInvocation { .. }
            | PipelineError::InvalidTransition(_)
            | PipelineError::ConcurrentModification { .. } => 3,
            _ => 1,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.exit_code() == 2
    }
}
