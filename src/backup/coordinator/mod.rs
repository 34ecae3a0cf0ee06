//! The backup coordinator: one native cursor driven step by step from a single
//! owner thread, with the blocking copy work running on a shared pool.

pub mod state;

use crate::backup::cursor::sqlite::{BackupOptions, SharedConnection, SqliteCursor};
use crate::backup::cursor::{BackupCursor, StepReport};
use crate::backup::function_path;
use crate::backup::owner_loop::{Dispatcher, OwnerLoop};
use crate::backup::page_count::PageCount;
use crate::backup::result_error::engine::EngineError;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::usage::UsageError;
use crate::backup::result_error::WithDebugObjectAndFnName;
use derive_more::Display;
use function_name::named;
use getset::{CopyGetters, Getters};
use state::CoordinatorState;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Progress counters as reported by the engine after a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Progress {
    pub remaining: u32,
    pub total: u32,
}

impl Progress {
    pub fn copied(&self) -> u32 {
        self.total.saturating_sub(self.remaining)
    }
}

/// What a step resolves with when it did not fail fatally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Progress { remaining: u32, total: u32 },
    Done { total: u32 },
    /// The source or destination was busy or locked. Nothing was lost; step again later.
    Retryable(EngineError),
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum FinishStatus {
    #[display("complete")]
    Complete,
    #[display("partial")]
    Partial,
}

/// Final status of a coordinator, reported by every `finish` call once closed.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct FinishReport {
    #[getset(get_copy = "pub")]
    status: FinishStatus,
    #[getset(get = "pub")]
    last_error: Option<EngineError>,
    #[getset(get_copy = "pub")]
    progress: Option<Progress>,
}

impl FinishReport {
    pub fn is_complete(&self) -> bool {
        self.status == FinishStatus::Complete
    }
}

enum Phase {
    Idle(Box<dyn BackupCursor>),
    // The cursor is on a worker thread.
    Stepping,
    Finished(Box<dyn BackupCursor>),
    Errored(Box<dyn BackupCursor>),
    Closed(FinishReport),
}

impl Phase {
    fn state(&self) -> CoordinatorState {
        match self {
            Phase::Idle(_) => CoordinatorState::Idle,
            Phase::Stepping => CoordinatorState::Stepping,
            Phase::Finished(_) => CoordinatorState::Finished,
            Phase::Errored(_) => CoordinatorState::Errored,
            Phase::Closed(_) => CoordinatorState::Closed,
        }
    }

    /// Puts a cursor back into the phase it was taken from.
    fn holding(state: CoordinatorState, cursor: Box<dyn BackupCursor>) -> Phase {
        match state {
            CoordinatorState::Finished => Phase::Finished(cursor),
            CoordinatorState::Errored => Phase::Errored(cursor),
            _ => Phase::Idle(cursor),
        }
    }
}

/// State shared between the caller's handle and the owner loop's pending registry.
pub(crate) struct CoordinatorCore {
    id: u64,
    phase: Phase,
    last_progress: Option<Progress>,
    last_error: Option<EngineError>,
    disposed: bool,
}

impl CoordinatorCore {
    fn new(id: u64, cursor: Box<dyn BackupCursor>) -> Self {
        Self {
            id,
            phase: Phase::Idle(cursor),
            last_progress: None,
            last_error: None,
            disposed: false,
        }
    }

    pub(crate) fn state(&self) -> CoordinatorState {
        self.phase.state()
    }

    fn begin_step(&mut self) -> std::result::Result<Box<dyn BackupCursor>, UsageError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(UsageError::NotSteppable(state));
        }
        match std::mem::replace(&mut self.phase, Phase::Stepping) {
            Phase::Idle(cursor) => Ok(cursor),
            other => {
                self.phase = other;
                Err(UsageError::StepInFlight)
            }
        }
    }

    /// Hands the cursor back after a worker ran one step and classifies the result.
    pub(crate) fn settle(
        &mut self,
        cursor: Box<dyn BackupCursor>,
        report: StepReport,
    ) -> Result<StepOutcome> {
        debug_assert_eq!(self.state(), CoordinatorState::Stepping);
        let (phase, outcome) = match report {
            StepReport::Progress { remaining, total } => {
                debug!("Backup #{} copied pages, {remaining}/{total} remaining", self.id);
                self.last_progress = Some(Progress { remaining, total });
                (
                    Phase::Idle(cursor),
                    Ok(StepOutcome::Progress { remaining, total }),
                )
            }
            StepReport::Done { total } => {
                info!("Backup #{} copied all {total} pages", self.id);
                self.last_progress = Some(Progress {
                    remaining: 0,
                    total,
                });
                (Phase::Finished(cursor), Ok(StepOutcome::Done { total }))
            }
            StepReport::Failed(e) if e.is_retryable() => {
                warn!("Backup #{} step hit a lock, may be retried: {e}", self.id);
                (Phase::Idle(cursor), Ok(StepOutcome::Retryable(e)))
            }
            StepReport::Failed(e) => {
                warn!("Backup #{} step failed: {e}", self.id);
                self.last_error = Some(e.clone());
                (Phase::Errored(cursor), Err(Error::Engine(e)))
            }
        };
        self.phase = phase;
        outcome
    }

    /// Releases the cursor on the owner thread, or leaves everything as it was
    /// when a connection is held by a step in flight elsewhere.
    fn finish(&mut self) -> Result<FinishReport> {
        let state = self.state();
        let mut cursor = match std::mem::replace(&mut self.phase, Phase::Stepping) {
            Phase::Stepping => return Err(UsageError::FinishWhileStepping.into()),
            Phase::Closed(report) => {
                self.phase = Phase::Closed(report.clone());
                return Ok(report);
            }
            Phase::Idle(cursor) | Phase::Finished(cursor) | Phase::Errored(cursor) => cursor,
        };

        match cursor.finish() {
            Ok(()) => Ok(self.closed(state, None)),
            Err(e) if e.is_retryable() => {
                debug!("Backup #{} release has to wait: {e}", self.id);
                self.phase = Phase::holding(state, cursor);
                Err(Error::Engine(e))
            }
            Err(e) => Ok(self.closed(state, Some(e))),
        }
    }

    /// Records the final report. Only a copy that reached the end and was
    /// released cleanly counts as complete.
    fn closed(&mut self, from: CoordinatorState, native: Option<EngineError>) -> FinishReport {
        let status = match (from, &native) {
            (CoordinatorState::Finished, None) => FinishStatus::Complete,
            _ => FinishStatus::Partial,
        };
        let report = FinishReport {
            status,
            last_error: self.last_error.clone().or(native),
            progress: self.last_progress,
        };
        match &report.last_error {
            None => info!("Backup #{} closed: {}", self.id, report.status),
            Some(e) => warn!("Backup #{} closed: {} ({e})", self.id, report.status),
        }
        self.phase = Phase::Closed(report.clone());
        report
    }

    /// Like `finish`, but never fails: mid-step the release is deferred until
    /// the result is delivered, and a release that would have to wait for a
    /// connection is handed to a worker.
    fn close(&mut self, dispatcher: &Dispatcher) {
        if self.state() == CoordinatorState::Stepping {
            debug!("Backup #{} disposed mid-step, release deferred", self.id);
            self.disposed = true;
            return;
        }
        let Err(e) = self.finish() else {
            return;
        };
        let state = self.state();
        match std::mem::replace(&mut self.phase, Phase::Stepping) {
            Phase::Idle(cursor) | Phase::Finished(cursor) | Phase::Errored(cursor) => {
                debug!("Backup #{} releasing on a worker: {e}", self.id);
                self.closed(state, None);
                dispatcher.release_on_worker(cursor);
            }
            other => {
                self.phase = other;
                warn!("Backup #{} close failed: {e}", self.id);
            }
        }
    }

    /// Runs a release that was deferred because the handle went away mid-step.
    pub(crate) fn release_if_disposed(&mut self, dispatcher: &Dispatcher) {
        if self.disposed && self.state() != CoordinatorState::Stepping {
            self.disposed = false;
            self.close(dispatcher);
        }
    }
}

/// Handle to a single backup in progress.
///
/// Not `Send`: every method must be called on the thread that owns the
/// [`OwnerLoop`] it was created with, and every step result is delivered
/// there too. Dropping the handle closes the backup; if a step is in flight
/// at that moment the release waits until its result has been delivered.
pub struct Coordinator {
    core: Rc<RefCell<CoordinatorCore>>,
    dispatcher: Rc<Dispatcher>,
}

impl Coordinator {
    /// Starts a backup of `source`'s main database into `destination_schema`
    /// of `destination`. Neither connection is closed by the coordinator.
    pub fn create(
        owner: &OwnerLoop,
        source: &SharedConnection,
        destination: &SharedConnection,
        destination_schema: &str,
    ) -> Result<Self> {
        let options = BackupOptions::builder()
            .destination_schema(destination_schema)
            .build();
        Self::create_with_options(owner, source, destination, &options)
    }

    pub fn create_with_options(
        owner: &OwnerLoop,
        source: &SharedConnection,
        destination: &SharedConnection,
        options: &BackupOptions,
    ) -> Result<Self> {
        let cursor = SqliteCursor::new(source, destination, options)
            .with_debug_object_and_fn_name(options.clone(), "Coordinator::create")?;
        Ok(Self::with_cursor(owner, Box::new(cursor)))
    }

    /// Binds an already initialized cursor.
    pub fn with_cursor(owner: &OwnerLoop, cursor: Box<dyn BackupCursor>) -> Self {
        let dispatcher = owner.dispatcher();
        let id = dispatcher.next_coordinator_id();
        debug!("Backup #{id} created");
        Self {
            core: Rc::new(RefCell::new(CoordinatorCore::new(id, cursor))),
            dispatcher,
        }
    }

    pub fn id(&self) -> u64 {
        self.core.borrow().id
    }

    pub fn state(&self) -> CoordinatorState {
        self.core.borrow().state()
    }

    pub fn last_progress(&self) -> Option<Progress> {
        self.core.borrow().last_progress
    }

    /// Queues one step of up to `pages` pages on the worker pool.
    ///
    /// Returns immediately. `sink` runs later on the owner thread, from
    /// [`OwnerLoop::turn`] or [`OwnerLoop::run`], with the step's outcome; a
    /// fatal engine error arrives as `Err(Error::Engine(_))`. Fails right away,
    /// without dispatching anything, unless the coordinator is idle.
    #[named]
    pub fn step<F>(&self, pages: PageCount, sink: F) -> Result<()>
    where
        F: FnOnce(Result<StepOutcome>) + 'static,
    {
        let id = self.id();
        let cursor = self
            .core
            .borrow_mut()
            .begin_step()
            .map_err(Error::from)
            .with_debug_object_and_fn_name(id, function_path!())?;
        debug!("Backup #{id} stepping {pages}");
        self.dispatcher
            .dispatch(self.core.clone(), cursor, pages, Box::new(sink));
        Ok(())
    }

    /// Releases the native cursor, whatever is left to copy.
    ///
    /// Rejected while a step is in flight. Once closed, later calls return the
    /// same report without touching the engine again. Never waits: if another
    /// coordinator's step currently holds one of the connections, this fails
    /// with a retryable [`EngineError`] and the coordinator is left unchanged.
    #[named]
    pub fn finish(&self) -> Result<FinishReport> {
        let id = self.id();
        self.core
            .borrow_mut()
            .finish()
            .with_debug_object_and_fn_name(id, function_path!())
    }

    /// Best-effort teardown. Never fails; a release that cannot happen yet
    /// because a step is in flight happens once that step's result is delivered.
    pub fn close(&self) {
        self.core.borrow_mut().close(&self.dispatcher);
    }
}

impl Debug for Coordinator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}
