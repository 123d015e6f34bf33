//! Deterministic single-threaded coordinator for tests.
//!
//! Instead of worker threads, runnable actors queue up in FIFO order
//! and test code drives them explicitly: `run_once` executes one resume
//! step, `run` drains the queue. Combined with the virtual test clock
//! this makes every interleaving reproducible.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::actor::cell::ResumeResult;
use crate::actor::ActorCell;

/// Queue of runnable actors, drained by the test driver.
pub struct TestCore {
    queue: Mutex<VecDeque<Arc<ActorCell>>>,
    max_throughput: usize,
}

impl TestCore {
    pub fn new(max_throughput: usize) -> Arc<TestCore> {
        Arc::new(TestCore {
            queue: Mutex::new(VecDeque::new()),
            max_throughput,
        })
    }

    pub fn schedule(&self, cell: Arc<ActorCell>) {
        self.queue.lock().push_back(cell);
    }

    /// Whether any actor is runnable.
    pub fn has_job(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Number of runnable actors.
    pub fn jobs(&self) -> usize {
        self.queue.lock().len()
    }

    /// Resume the next runnable actor once. Returns false when the
    /// queue is empty.
    pub fn run_once(&self) -> bool {
        let cell = match self.queue.lock().pop_front() {
            Some(cell) => cell,
            None => return false,
        };
        match cell.resume(self.max_throughput) {
            ResumeResult::ResumeLater => self.queue.lock().push_back(cell),
            ResumeResult::Awaiting | ResumeResult::Done => {}
        }
        true
    }

    /// Drain the queue, returning the number of resume steps executed.
    pub fn run(&self) -> usize {
        let mut steps = 0;
        while self.run_once() {
            steps += 1;
        }
        steps
    }
}

impl std::fmt::Debug for TestCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCore")
            .field("jobs", &self.jobs())
            .finish()
    }
}
