//! Polaris Processing
//!
//! Dependency graph of processing steps, as used for combining
//! calibration frames. A step becomes runnable once all its precursors
//! are complete; status changes ripple to successors.

pub mod error;
pub mod network;
pub mod step;

pub use error::{ProcessingError, ProcessingResult};
pub use network::{ProcessingNetwork, StepId};
pub use step::{FnStep, StepStatus, StepWork};
