//! Step status and step work

use std::fmt;

/// Status of a processing step
///
/// Ordered so that a step can never be further along than the least
/// advanced of its precursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepStatus {
    Idle,
    NeedsWork,
    Working,
    Complete,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Idle => "idle",
            StepStatus::NeedsWork => "needswork",
            StepStatus::Working => "working",
            StepStatus::Complete => "complete",
            StepStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The work a step performs once its inputs are available
pub trait StepWork: Send + Sync {
    /// Do the work and report the resulting status, usually `Complete`
    fn do_work(&self) -> anyhow::Result<StepStatus>;

    /// Abort work in progress
    fn cancel(&self) {}
}

/// Adapts a closure to [`StepWork`]
pub struct FnStep<F> {
    f: F,
}

impl<F> FnStep<F>
where
    F: Fn() -> anyhow::Result<StepStatus> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> StepWork for FnStep<F>
where
    F: Fn() -> anyhow::Result<StepStatus> + Send + Sync,
{
    fn do_work(&self) -> anyhow::Result<StepStatus> {
        (self.f)()
    }
}
