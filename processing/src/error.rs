//! Processing error types

use crate::network::StepId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("Step {0} not found")]
    NotFound(StepId),

    #[error("No step named '{0}'")]
    NoSuchName(String),

    #[error("Step {0} cannot depend on itself")]
    SelfDependency(StepId),

    #[error("Making {precursor} a precursor of {step} would create a cycle")]
    Cycle { precursor: StepId, step: StepId },
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;
