use derive_more::Display;

/// Observable lifecycle of a backup coordinator.
///
/// `Idle -> Stepping` on `step`; `Stepping` goes back to `Idle` on progress or a
/// busy/locked result, to `Finished` when nothing remains and to `Errored` on a
/// fatal engine error. `finish`/`close` move any state but `Stepping` to `Closed`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    #[display("idle")]
    Idle,
    #[display("stepping")]
    Stepping,
    #[display("finished")]
    Finished,
    #[display("errored")]
    Errored,
    #[display("closed")]
    Closed,
}

impl CoordinatorState {
    /// No further step will ever be accepted from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CoordinatorState::Finished | CoordinatorState::Errored | CoordinatorState::Closed
        )
    }
}
