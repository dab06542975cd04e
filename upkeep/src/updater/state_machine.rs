use crate::updater::deployments::Step;

/// Why a step did not succeed. Steps that check several conditions report each violation in `details`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub message: String,
    pub details: Vec<String>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: vec![],
        }
    }

    pub fn with_details(message: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            message: message.into(),
            details,
        }
    }
}

pub type StepResult = Result<(), StepFailure>;

/// What the orchestrator does after a step finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance(Step),

    /// The final step succeeded.
    Complete,

    /// Stop without touching the installation.
    Fail,

    /// Restore the backup taken before the destructive steps.
    RollBack,
}

/// Maps a step's outcome to the next transition. Only destructive steps roll back, and only when a backup exists.
pub fn next(step: Step, outcome: &StepResult, backup_taken: bool) -> Transition {
    if outcome.is_ok() {
        return match step.next() {
            Some(next) => Transition::Advance(next),
            None => Transition::Complete,
        };
    }

    if step.is_destructive() && backup_taken {
        return Transition::RollBack;
    }

    Transition::Fail
}
