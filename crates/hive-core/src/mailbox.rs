//! Per-actor mailbox: multi-producer/single-consumer with two priority
//! bands.
//!
//! Producers may push from any thread; only the owning actor dequeues,
//! on whichever worker currently runs it. The mailbox tracks three
//! states:
//!
//! - `Open`: the actor is scheduled or running; pushes just enqueue.
//! - `Blocked`: the actor is parked on an empty mailbox; the first push
//!   reopens the mailbox and tells the caller to schedule the actor.
//! - `Closed`: the actor terminated; pushes are rejected and the
//!   element handed back for error synthesis.
//!
//! The `empty -> nonempty` transition while blocked must be atomic with
//! the "became runnable" answer, so the whole structure sits behind one
//! short-held mutex. A condition variable wakes blocking receivers
//! (scoped and detached actors).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::envelope::Envelope;
use crate::mid::MessagePriority;

/// Outcome of a push.
#[derive(Debug)]
pub enum EnqueueResult {
    /// Stored; the actor is already scheduled or running.
    Enqueued,
    /// Stored and the mailbox left the blocked state; the caller must
    /// schedule the actor.
    BecameUnblocked,
    /// The mailbox is closed; the element was not stored.
    Dropped(Envelope),
}

impl PartialEq for EnqueueResult {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (EnqueueResult::Enqueued, EnqueueResult::Enqueued)
                | (EnqueueResult::BecameUnblocked, EnqueueResult::BecameUnblocked)
                | (EnqueueResult::Dropped(_), EnqueueResult::Dropped(_))
        )
    }
}

impl Eq for EnqueueResult {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MailboxState {
    Open,
    Blocked,
    Closed,
}

struct MailboxInner {
    urgent: VecDeque<Envelope>,
    normal: VecDeque<Envelope>,
    state: MailboxState,
}

impl MailboxInner {
    fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty()
    }
}

/// Two-band MPSC queue with a blocked flag and terminal state.
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
    nonempty: Condvar,
}

impl Mailbox {
    /// A new mailbox in the blocked state: the first push reports
    /// `BecameUnblocked` so lazily spawned actors get scheduled on
    /// their first message.
    pub fn new() -> Mailbox {
        Mailbox {
            inner: Mutex::new(MailboxInner {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                state: MailboxState::Blocked,
            }),
            nonempty: Condvar::new(),
        }
    }

    /// Append an element to its band.
    pub fn push(&self, env: Envelope) -> EnqueueResult {
        let mut inner = self.inner.lock();
        match inner.state {
            MailboxState::Closed => return EnqueueResult::Dropped(env),
            MailboxState::Open | MailboxState::Blocked => {}
        }
        let was_blocked = inner.state == MailboxState::Blocked;
        match env.priority() {
            MessagePriority::Urgent => inner.urgent.push_back(env),
            MessagePriority::Normal => inner.normal.push_back(env),
        }
        inner.state = MailboxState::Open;
        drop(inner);
        self.nonempty.notify_one();
        if was_blocked {
            EnqueueResult::BecameUnblocked
        } else {
            EnqueueResult::Enqueued
        }
    }

    /// Dequeue the next element, urgent band first. Only the owning
    /// actor calls this.
    pub fn try_pop(&self) -> Option<Envelope> {
        let mut inner = self.inner.lock();
        inner.urgent.pop_front().or_else(|| inner.normal.pop_front())
    }

    /// Attempt the `Open -> Blocked` transition. Succeeds only on an
    /// empty, open mailbox; a false return means new elements raced in
    /// and the actor must keep running.
    pub fn try_block(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == MailboxState::Open && inner.is_empty() {
            inner.state = MailboxState::Blocked;
            true
        } else {
            inner.state != MailboxState::Closed && inner.is_empty()
        }
    }

    /// Leave the blocked state without a push. Used for eagerly
    /// scheduled actors so the first message does not schedule a second
    /// job.
    pub fn reopen(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MailboxState::Blocked {
            inner.state = MailboxState::Open;
        }
    }

    /// Close the mailbox, returning all undelivered elements. Later
    /// pushes report `Dropped`.
    pub fn close(&self) -> Vec<Envelope> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.state = MailboxState::Closed;
        let mut drained: Vec<Envelope> = inner.urgent.drain(..).collect();
        drained.extend(inner.normal.drain(..));
        drop(guard);
        // Wake blocking receivers so they observe the closed state.
        self.nonempty.notify_all();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == MailboxState::Closed
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.urgent.len() + inner.normal.len()
    }

    /// Re-insert previously skipped elements ahead of everything else
    /// in their bands, preserving their relative order.
    pub fn prepend(&self, batch: Vec<Envelope>) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == MailboxState::Closed {
            return;
        }
        for env in batch.into_iter().rev() {
            match env.priority() {
                MessagePriority::Urgent => inner.urgent.push_front(env),
                MessagePriority::Normal => inner.normal.push_front(env),
            }
        }
    }

    /// Park the calling thread until an element arrives, the mailbox
    /// closes, or `timeout` elapses. Used by blocking receivers only.
    /// Returns false on timeout.
    pub fn wait_nonempty(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if !inner.is_empty() || inner.state == MailboxState::Closed {
                return true;
            }
            match deadline {
                None => self.nonempty.wait(&mut inner),
                Some(deadline) => {
                    if self.nonempty.wait_until(&mut inner, deadline).timed_out() {
                        return !inner.is_empty() || inner.state == MailboxState::Closed;
                    }
                }
            }
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mailbox")
            .field("urgent", &inner.urgent.len())
            .field("normal", &inner.normal.len())
            .field("state", &inner.state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IntoMessage;

    fn env(n: i64) -> Envelope {
        Envelope::asynchronous(None, (n,).into_message())
    }

    fn urgent_env(n: i64) -> Envelope {
        Envelope::urgent(None, (n,).into_message())
    }

    fn payload(env: &Envelope) -> i64 {
        *env.content.get::<i64>(0).unwrap()
    }

    #[test]
    fn test_fifo_within_band() {
        let mb = Mailbox::new();
        mb.push(env(1));
        mb.push(env(2));
        mb.push(env(3));
        assert_eq!(payload(&mb.try_pop().unwrap()), 1);
        assert_eq!(payload(&mb.try_pop().unwrap()), 2);
        assert_eq!(payload(&mb.try_pop().unwrap()), 3);
        assert!(mb.try_pop().is_none());
    }

    #[test]
    fn test_urgent_band_drains_first() {
        let mb = Mailbox::new();
        mb.push(env(1));
        mb.push(urgent_env(10));
        mb.push(env(2));
        mb.push(urgent_env(11));
        assert_eq!(payload(&mb.try_pop().unwrap()), 10);
        assert_eq!(payload(&mb.try_pop().unwrap()), 11);
        assert_eq!(payload(&mb.try_pop().unwrap()), 1);
        assert_eq!(payload(&mb.try_pop().unwrap()), 2);
    }

    #[test]
    fn test_first_push_unblocks() {
        let mb = Mailbox::new();
        assert_eq!(mb.push(env(1)), EnqueueResult::BecameUnblocked);
        assert_eq!(mb.push(env(2)), EnqueueResult::Enqueued);
    }

    #[test]
    fn test_block_unblock_cycle() {
        let mb = Mailbox::new();
        mb.push(env(1));
        mb.try_pop().unwrap();
        assert!(mb.try_block());
        assert_eq!(mb.push(env(2)), EnqueueResult::BecameUnblocked);
    }

    #[test]
    fn test_block_fails_when_nonempty() {
        let mb = Mailbox::new();
        mb.push(env(1));
        assert!(!mb.try_block());
        // Still open: further pushes do not ask for scheduling.
        assert_eq!(mb.push(env(2)), EnqueueResult::Enqueued);
    }

    #[test]
    fn test_close_drains_and_rejects() {
        let mb = Mailbox::new();
        mb.push(env(1));
        mb.push(urgent_env(2));
        let drained = mb.close();
        assert_eq!(drained.len(), 2);
        assert!(mb.is_closed());
        match mb.push(env(3)) {
            EnqueueResult::Dropped(e) => assert_eq!(payload(&e), 3),
            other => panic!("expected Dropped, got {:?}", other),
        }
    }

    #[test]
    fn test_prepend_preserves_order() {
        let mb = Mailbox::new();
        mb.push(env(3));
        mb.prepend(vec![env(1), env(2)]);
        assert_eq!(payload(&mb.try_pop().unwrap()), 1);
        assert_eq!(payload(&mb.try_pop().unwrap()), 2);
        assert_eq!(payload(&mb.try_pop().unwrap()), 3);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;

        let mb = Arc::new(Mailbox::new());
        let threads = 8;
        let per_thread = 250;
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let mb = Arc::clone(&mb);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        mb.push(env((t * per_thread + i) as i64));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mb.len(), threads * per_thread);
        let mut seen = 0;
        while mb.try_pop().is_some() {
            seen += 1;
        }
        assert_eq!(seen, threads * per_thread);
    }

    #[test]
    fn test_wait_nonempty_times_out() {
        let mb = Mailbox::new();
        assert!(!mb.wait_nonempty(Some(Duration::from_millis(10))));
        mb.push(env(1));
        assert!(mb.wait_nonempty(Some(Duration::from_millis(10))));
    }
}
