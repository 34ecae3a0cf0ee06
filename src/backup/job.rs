//! Drives a coordinator from first step to finish, the way a caller of the
//! step API would: fixed-size rounds, progress callbacks and a bounded
//! retry budget for busy/locked rounds.

use crate::backup::coordinator::{Coordinator, FinishReport, Progress, StepOutcome};
use crate::backup::cursor::sqlite::{share, BackupOptions};
use crate::backup::owner_loop::OwnerLoop;
use crate::backup::page_count::PageCount;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use bon::Builder;
use getset::CopyGetters;
use rayon::ThreadPool;
use rusqlite::{Connection, OpenFlags};
use std::cell::RefCell;
use std::num::NonZeroU32;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pages per round used when nothing else is configured.
pub const DEFAULT_RATE: NonZeroU32 = match NonZeroU32::new(100) {
    Some(rate) => rate,
    None => unreachable!(),
};
pub const DEFAULT_BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_BUSY_RETRIES: u32 = 20;

#[derive(Clone, Copy, Debug, Builder, CopyGetters, PartialEq, Eq)]
#[getset(get_copy = "pub")]
pub struct StepPolicy {
    #[builder(default = PageCount::Pages(DEFAULT_RATE), into)]
    rate: PageCount,
    #[builder(default = DEFAULT_BUSY_RETRY_DELAY)]
    busy_retry_delay: Duration,
    /// Consecutive busy/locked rounds tolerated before giving up.
    #[builder(default = DEFAULT_MAX_BUSY_RETRIES)]
    max_busy_retries: u32,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Steps `coordinator` until the engine reports completion, then finishes it.
///
/// Blocks the calling thread: it drives `owner` with [`OwnerLoop::run`] and
/// sleeps between busy rounds, so call it from a thread that has nothing else
/// to service, never from inside an event loop.
///
/// `progress` sees the counters after every round that copied something. The
/// coordinator is finished on every path, so on error its cursor is already
/// released when this returns.
pub fn run_to_completion<P>(
    owner: &OwnerLoop,
    coordinator: &Coordinator,
    policy: &StepPolicy,
    mut progress: P,
) -> Result<FinishReport>
where
    P: FnMut(Progress),
{
    let mut busy_rounds = 0;
    let copied = loop {
        let slot = Rc::new(RefCell::new(None));
        let sink_slot = slot.clone();
        let res = coordinator
            .step(policy.rate, move |res| *sink_slot.borrow_mut() = Some(res))
            .and_then(|_| owner.run())
            .and_then(|_| {
                slot.borrow_mut()
                    .take()
                    .unwrap_or_else(|| Err(Error::OwnerLoopDisconnected(0)))
            });

        match res {
            Ok(StepOutcome::Progress { remaining, total }) => {
                busy_rounds = 0;
                progress(Progress { remaining, total });
            }
            Ok(StepOutcome::Done { total }) => {
                progress(Progress {
                    remaining: 0,
                    total,
                });
                break Ok(());
            }
            Ok(StepOutcome::Retryable(e)) => {
                busy_rounds += 1;
                if busy_rounds > policy.max_busy_retries {
                    break Err(Error::BusyRetriesExhausted {
                        attempts: busy_rounds,
                        last: e,
                    });
                }
                debug!(
                    "Backup #{} busy ({busy_rounds}/{}), retrying in {:?}",
                    coordinator.id(),
                    policy.max_busy_retries,
                    policy.busy_retry_delay
                );
                std::thread::sleep(policy.busy_retry_delay);
            }
            Err(e) => break Err(e),
        }
    };

    let finished = coordinator.finish();
    match copied {
        Ok(()) => finished,
        Err(e) => {
            let e = match finished {
                Ok(report) => {
                    warn!("Backup #{} released after failure: {}", coordinator.id(), report.status());
                    e
                }
                Err(finish_error) => e.chain(finish_error),
            };
            Err(e.with_msg(format!("Backup #{} aborted", coordinator.id())))
        }
    }
}

/// Copies the database at `source_path` into `destination_path` on `pool`.
///
/// The source is opened read-only; the destination is created if missing and
/// overwritten otherwise.
pub fn backup_database<P>(
    pool: Arc<ThreadPool>,
    source_path: &Path,
    destination_path: &Path,
    options: &BackupOptions,
    policy: &StepPolicy,
    progress: P,
) -> Result<FinishReport>
where
    P: FnMut(Progress),
{
    let source = Connection::open_with_flags(
        source_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(Error::from)
    .with_msg(format!("Open source database failed: {source_path:?}"))?;
    let destination = Connection::open(destination_path)
        .map_err(Error::from)
        .with_msg(format!("Open destination database failed: {destination_path:?}"))?;
    let source = share(source);
    let destination = share(destination);

    let owner = OwnerLoop::new(pool);
    let coordinator = Coordinator::create_with_options(&owner, &source, &destination, options)?;
    info!(
        "Backing up {source_path:?} into {destination_path:?} ({} per round)",
        policy.rate
    );
    run_to_completion(&owner, &coordinator, policy, progress)
        .with_debug_object_and_fn_name(source_path.to_path_buf(), "backup_database")
}
