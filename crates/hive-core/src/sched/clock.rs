//! The actor clock: delayed deliveries, behavior timeouts, request
//! deadlines.
//!
//! Everything time-based in the runtime is one primitive: deliver an
//! envelope to an address after a delay. The threaded clock runs a
//! timer thread over a binary heap; the test clock keeps virtual time
//! that test code advances explicitly.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::actor::ActorAddr;
use crate::envelope::Envelope;

/// Clonable handle to the system clock.
#[derive(Clone)]
pub enum ClockHandle {
    Thread(Arc<ThreadClock>),
    Test(Arc<TestClock>),
}

impl ClockHandle {
    /// Deliver `env` to `dest` after `delay`.
    pub(crate) fn schedule(&self, delay: Duration, dest: ActorAddr, env: Envelope) {
        match self {
            ClockHandle::Thread(clock) => clock.schedule(delay, dest, env),
            ClockHandle::Test(clock) => clock.schedule(delay, dest, env),
        }
    }

    pub(crate) fn shutdown(&self) {
        match self {
            ClockHandle::Thread(clock) => clock.shutdown(),
            ClockHandle::Test(_) => {}
        }
    }
}

fn deliver(dest: &ActorAddr, env: Envelope) {
    if let Some(dest) = dest.upgrade() {
        dest.enqueue(env);
    }
}

// ---------------------------------------------------------------------------
// ThreadClock
// ---------------------------------------------------------------------------

struct TimerEntry {
    at: Instant,
    seq: u64,
    dest: ActorAddr,
    env: Envelope,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest
        // deadline on top. Sequence breaks ties FIFO.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ThreadClockInner {
    entries: BinaryHeap<TimerEntry>,
    seq: u64,
    shutdown: bool,
}

/// Timer thread over a deadline heap.
pub struct ThreadClock {
    inner: Mutex<ThreadClockInner>,
    wakeup: Condvar,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ThreadClock {
    pub fn start() -> Arc<ThreadClock> {
        let clock = Arc::new(ThreadClock {
            inner: Mutex::new(ThreadClockInner {
                entries: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            handle: Mutex::new(None),
        });
        let clock_ref = Arc::clone(&clock);
        let handle = std::thread::Builder::new()
            .name("hive-clock".to_string())
            .spawn(move || clock_loop(clock_ref))
            .expect("spawn clock thread");
        *clock.handle.lock() = Some(handle);
        clock
    }

    pub fn schedule(&self, delay: Duration, dest: ActorAddr, env: Envelope) {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }
        inner.seq += 1;
        let entry = TimerEntry {
            at: Instant::now() + delay,
            seq: inner.seq,
            dest,
            env,
        };
        inner.entries.push(entry);
        drop(inner);
        self.wakeup.notify_one();
    }

    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            inner.entries.clear();
        }
        self.wakeup.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn clock_loop(clock: Arc<ThreadClock>) {
    loop {
        let due = {
            let mut inner = clock.inner.lock();
            loop {
                if inner.shutdown {
                    return;
                }
                let now = Instant::now();
                match inner.entries.peek() {
                    None => {
                        clock.wakeup.wait(&mut inner);
                    }
                    Some(entry) if entry.at <= now => {
                        break inner.entries.pop().expect("peeked entry");
                    }
                    Some(entry) => {
                        let at = entry.at;
                        clock.wakeup.wait_until(&mut inner, at);
                    }
                }
            }
        };
        deliver(&due.dest, due.env);
    }
}

// ---------------------------------------------------------------------------
// TestClock
// ---------------------------------------------------------------------------

struct TestEntry {
    due: Duration,
    seq: u64,
    dest: ActorAddr,
    env: Envelope,
}

struct TestClockInner {
    now: Duration,
    seq: u64,
    entries: Vec<TestEntry>,
}

/// Virtual-time clock for deterministic tests.
pub struct TestClock {
    inner: Mutex<TestClockInner>,
}

impl TestClock {
    pub fn new() -> Arc<TestClock> {
        Arc::new(TestClock {
            inner: Mutex::new(TestClockInner {
                now: Duration::ZERO,
                seq: 0,
                entries: Vec::new(),
            }),
        })
    }

    pub fn schedule(&self, delay: Duration, dest: ActorAddr, env: Envelope) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let entry = TestEntry {
            due: inner.now + delay,
            seq: inner.seq,
            dest,
            env,
        };
        inner.entries.push(entry);
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Advance virtual time, firing everything that becomes due.
    /// Returns the number of fired timers.
    pub fn advance(&self, delta: Duration) -> usize {
        let due = {
            let mut inner = self.inner.lock();
            inner.now += delta;
            let now = inner.now;
            let mut due: Vec<TestEntry> = Vec::new();
            let mut keep: Vec<TestEntry> = Vec::new();
            for entry in inner.entries.drain(..) {
                if entry.due <= now {
                    due.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            inner.entries = keep;
            due.sort_by_key(|e| (e.due, e.seq));
            due
        };
        let count = due.len();
        for entry in due {
            deliver(&entry.dest, entry.env);
        }
        count
    }

    /// Fire the earliest armed timer regardless of its due time.
    pub fn trigger_timeout(&self) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            if inner.entries.is_empty() {
                return false;
            }
            let min_index = inner
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.due, e.seq))
                .map(|(i, _)| i)
                .expect("nonempty");
            inner.entries.swap_remove(min_index)
        };
        deliver(&entry.dest, entry.env);
        true
    }

    /// Fire every armed timer in due order. Returns the count.
    pub fn trigger_timeouts(&self) -> usize {
        let mut count = 0;
        while self.trigger_timeout() {
            count += 1;
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_entry_order() {
        let now = Instant::now();
        let addr = ActorAddr::unbound(crate::node::NodeId::zero(), 1);
        let make = |offset_ms: u64, seq: u64| TimerEntry {
            at: now + Duration::from_millis(offset_ms),
            seq,
            dest: addr.clone(),
            env: Envelope::asynchronous(None, crate::message::Message::empty()),
        };
        let mut heap = BinaryHeap::new();
        heap.push(make(30, 1));
        heap.push(make(10, 2));
        heap.push(make(10, 3));
        heap.push(make(20, 4));
        // Earliest deadline first; FIFO among equals.
        assert_eq!(heap.pop().unwrap().seq, 2);
        assert_eq!(heap.pop().unwrap().seq, 3);
        assert_eq!(heap.pop().unwrap().seq, 4);
        assert_eq!(heap.pop().unwrap().seq, 1);
    }
}
