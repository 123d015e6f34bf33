//! Scheduling: the work-stealing worker pool, the deterministic test
//! coordinator, and the actor clock.
//!
//! Actors are `Send` jobs; whichever worker pops a cell runs its resume
//! step. A cell is re-enqueued only when resume reports
//! `ResumeLater` -- parked actors re-enter the queue through their
//! mailbox's blocked-flag transition.

pub mod clock;
pub mod pool;
pub mod testing;

pub use clock::{ClockHandle, TestClock, ThreadClock};
pub use pool::PoolCore;
pub use testing::TestCore;

use std::sync::Arc;

use crate::actor::ActorCell;

/// Clonable handle to the system's scheduler.
#[derive(Clone)]
pub enum SchedulerHandle {
    /// Work-stealing pool of OS threads.
    Pool(Arc<PoolCore>),
    /// Single-threaded coordinator driven by test code.
    Testing(Arc<TestCore>),
}

impl SchedulerHandle {
    /// Hand a runnable actor to the scheduler.
    pub(crate) fn schedule(&self, cell: Arc<ActorCell>) {
        match self {
            SchedulerHandle::Pool(core) => core.schedule(cell),
            SchedulerHandle::Testing(core) => core.schedule(cell),
        }
    }

    /// Stop workers and join their threads. Idempotent.
    pub(crate) fn shutdown(&self) {
        match self {
            SchedulerHandle::Pool(core) => core.shutdown(),
            SchedulerHandle::Testing(_) => {}
        }
    }
}
