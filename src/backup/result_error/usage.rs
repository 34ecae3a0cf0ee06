use crate::backup::coordinator::state::CoordinatorState;
use thiserror::Error;

/// Programming errors: the call was rejected before anything reached a worker.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    #[error("a step is already in flight; wait for its result before stepping again")]
    StepInFlight,
    #[error("cannot step a backup coordinator that is {0}")]
    NotSteppable(CoordinatorState),
    #[error("cannot finish while a step is in flight; wait for its result first")]
    FinishWhileStepping,
}
