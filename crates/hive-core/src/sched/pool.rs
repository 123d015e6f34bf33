//! Work-stealing scheduler.
//!
//! N worker threads (default: available parallelism), each with a local
//! crossbeam deque. Runnable actors enter through the global injector;
//! idle workers drain their local deque first, then the injector, then
//! steal from siblings. Workers with nothing to do park on a condition
//! variable with a short timeout as a lost-wakeup backstop.
//!
//! Fairness is FIFO within a worker's deque and nothing more; an actor
//! that exhausts its throughput budget goes to the back of the local
//! deque.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};

use crate::actor::cell::ResumeResult;
use crate::actor::ActorCell;

type Job = Arc<ActorCell>;

/// Shared state of the work-stealing pool.
pub struct PoolCore {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    /// Local deques, created up front and claimed by their threads at
    /// start.
    workers: Mutex<Vec<Option<Worker<Job>>>>,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    max_throughput: usize,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl PoolCore {
    /// Create the pool and start its worker threads.
    ///
    /// `workers == 0` selects the number of available CPU cores.
    pub fn start(workers: usize, max_throughput: usize) -> Arc<PoolCore> {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };
        let locals: Vec<Worker<Job>> = (0..workers).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(|w| w.stealer()).collect();
        let core = Arc::new(PoolCore {
            injector: Injector::new(),
            stealers,
            workers: Mutex::new(locals.into_iter().map(Some).collect()),
            sleep_lock: Mutex::new(()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            max_throughput,
            handles: Mutex::new(Vec::new()),
        });
        let mut handles = core.handles.lock();
        for index in 0..workers {
            let core_ref = Arc::clone(&core);
            let local = core.workers.lock()[index].take().expect("worker claimed once");
            handles.push(
                std::thread::Builder::new()
                    .name(format!("hive-worker-{}", index))
                    .spawn(move || worker_loop(core_ref, local, index))
                    .expect("spawn worker thread"),
            );
        }
        drop(handles);
        core
    }

    /// Push a runnable actor and wake one sleeper.
    pub fn schedule(&self, cell: Job) {
        self.injector.push(cell);
        self.wakeup.notify_one();
    }

    /// Stop all workers and join them. Must not be called from a
    /// worker thread.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wakeup.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn find_job(&self, local: &Worker<Job>, index: usize) -> Option<Job> {
        if let Some(job) = local.pop() {
            return Some(job);
        }
        // Refill from the injector.
        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
        // Steal from siblings, skipping our own stealer.
        for (i, stealer) in self.stealers.iter().enumerate() {
            if i == index {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }
}

fn worker_loop(core: Arc<PoolCore>, local: Worker<Job>, index: usize) {
    loop {
        if core.shutdown.load(Ordering::Acquire) {
            return;
        }
        match core.find_job(&local, index) {
            Some(cell) => match cell.resume(core.max_throughput) {
                ResumeResult::ResumeLater => local.push(cell),
                ResumeResult::Awaiting | ResumeResult::Done => {}
            },
            None => {
                let mut guard = core.sleep_lock.lock();
                if core.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if core.injector.is_empty() {
                    // Timeout bounds the cost of a lost wakeup.
                    core.wakeup
                        .wait_for(&mut guard, Duration::from_millis(10));
                }
            }
        }
    }
}

impl std::fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCore")
            .field("workers", &self.stealers.len())
            .field("max_throughput", &self.max_throughput)
            .finish()
    }
}
