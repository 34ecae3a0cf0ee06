//! The native backup cursor seam.
//!
//! A cursor is moved onto a worker thread for the duration of one step and
//! handed back with the result, so it only needs to be [`Send`].

pub mod sqlite;

use crate::backup::page_count::PageCount;
use crate::backup::result_error::engine::EngineError;

/// Raw result of a single native step, before any classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepReport {
    /// Pages were copied and `remaining` are still left out of `total`.
    Progress { remaining: u32, total: u32 },
    /// Nothing remains to copy.
    Done { total: u32 },
    Failed(EngineError),
}

pub trait BackupCursor: Send {
    /// Copies up to `pages` pages. Blocks on I/O, so never call it on the owner thread.
    fn step(&mut self, pages: PageCount) -> StepReport;

    /// Releases the native cursor without waiting. Reports a sticky error left
    /// behind by an earlier step, if there was one.
    ///
    /// A retryable error means nothing was released: a connection is held by
    /// another cursor's step. Dropping an unfinished cursor releases it too,
    /// but may wait for that step, so only drop one off the owner thread.
    fn finish(&mut self) -> Result<(), EngineError>;
}
