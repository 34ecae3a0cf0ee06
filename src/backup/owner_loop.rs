//! Hands step work to a shared worker pool and brings results back to the
//! single thread that owns the coordinators.

use crate::backup::coordinator::{CoordinatorCore, StepOutcome};
use crate::backup::cursor::{BackupCursor, StepReport};
use crate::backup::page_count::PageCount;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use rayon::ThreadPool;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, SendError, Sender, TryRecvError};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) type StepSink = Box<dyn FnOnce(Result<StepOutcome>)>;

/// What a worker sends back: the cursor it borrowed and the raw step result.
pub(crate) struct Completion {
    ticket: u64,
    cursor: Box<dyn BackupCursor>,
    report: StepReport,
}

struct PendingStep {
    // Keeps the coordinator alive until its result has been delivered.
    coordinator: Rc<RefCell<CoordinatorCore>>,
    sink: StepSink,
}

/// The owner-side half shared by every coordinator created on one loop.
pub(crate) struct Dispatcher {
    pool: Arc<ThreadPool>,
    tx: Sender<Completion>,
    pending: RefCell<HashMap<u64, PendingStep>>,
    next_ticket: Cell<u64>,
    next_coordinator: Cell<u64>,
}

impl Dispatcher {
    pub(crate) fn next_coordinator_id(&self) -> u64 {
        let id = self.next_coordinator.get();
        self.next_coordinator.set(id + 1);
        id
    }

    pub(crate) fn dispatch(
        &self,
        coordinator: Rc<RefCell<CoordinatorCore>>,
        mut cursor: Box<dyn BackupCursor>,
        pages: PageCount,
        sink: StepSink,
    ) {
        let ticket = self.next_ticket.get();
        self.next_ticket.set(ticket + 1);
        self.pending
            .borrow_mut()
            .insert(ticket, PendingStep { coordinator, sink });

        let tx = self.tx.clone();
        self.pool.spawn(move || {
            let report = cursor.step(pages);
            if let Err(SendError(completion)) = tx.send(Completion {
                ticket,
                cursor,
                report,
            }) {
                warn!(
                    "Owner loop is gone, discarding result of step #{}",
                    completion.ticket
                );
            }
        });
    }

    /// Drops `cursor` on the pool, where waiting for its connections is fine.
    pub(crate) fn release_on_worker(&self, cursor: Box<dyn BackupCursor>) {
        self.pool.spawn(move || drop(cursor));
    }
}

/// Event loop for the owner thread.
///
/// Coordinators created against a loop submit their steps to its pool; the
/// results are queued until the owner calls [`OwnerLoop::turn`] or
/// [`OwnerLoop::run`], which apply them and invoke the step callbacks.
pub struct OwnerLoop {
    dispatcher: Rc<Dispatcher>,
    rx: Receiver<Completion>,
}

impl OwnerLoop {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        let (tx, rx) = channel();
        Self {
            dispatcher: Rc::new(Dispatcher {
                pool,
                tx,
                pending: RefCell::default(),
                next_ticket: Cell::new(0),
                next_coordinator: Cell::new(0),
            }),
            rx,
        }
    }

    pub(crate) fn dispatcher(&self) -> Rc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Steps dispatched whose results have not been delivered yet.
    pub fn pending(&self) -> usize {
        self.dispatcher.pending.borrow().len()
    }

    /// Delivers every result that is already available, without waiting.
    pub fn turn(&self) -> usize {
        let mut delivered = 0;
        loop {
            match self.rx.try_recv() {
                Ok(completion) => {
                    self.deliver(completion);
                    delivered += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        delivered
    }

    /// Waits for and delivers results until no step is pending, including
    /// steps issued by callbacks along the way.
    pub fn run(&self) -> Result<usize> {
        let mut delivered = 0;
        while self.pending() > 0 {
            let completion = self
                .rx
                .recv()
                .map_err(|_| Error::OwnerLoopDisconnected(self.pending()))?;
            self.deliver(completion);
            delivered += 1;
        }
        Ok(delivered)
    }

    fn deliver(&self, completion: Completion) {
        let Completion {
            ticket,
            cursor,
            report,
        } = completion;
        let Some(PendingStep { coordinator, sink }) =
            self.dispatcher.pending.borrow_mut().remove(&ticket)
        else {
            warn!("No pending step for ticket #{ticket}");
            return;
        };
        debug!("Delivering step #{ticket}");

        let outcome = coordinator.borrow_mut().settle(cursor, report);
        sink(outcome);
        coordinator
            .borrow_mut()
            .release_if_disposed(&self.dispatcher);
    }
}

impl Drop for OwnerLoop {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            warn!("Owner loop dropped with {pending} step(s) in flight");
        }
    }
}
