//! Blocking actors: mailbox waits that park the OS thread.
//!
//! A [`ScopedActor`] is an unscheduled control block owned by the
//! calling thread, the runtime's bridge between regular threads and
//! actors: it can send, issue synchronous requests, and receive, all by
//! parking on its own mailbox condvar. The middleman implements its
//! synchronous facade calls on top of it.
//!
//! Detached actors (see `SpawnOptions::detached`) reuse the same wait
//! primitive but run the ordinary resume loop on their private thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::actor::address::{ActorAddr, ActorRef};
use crate::actor::cell::ActorCell;
use crate::envelope::Envelope;
use crate::error::{Error, ExitReason, SecCode};
use crate::message::{IntoMessage, Message};
use crate::mid::MessagePriority;
use crate::request::timeout_response;
use crate::sysmsg::DownMsg;
use crate::system::ActorSystem;

/// A blocking actor bound to the owning thread's lifetime.
///
/// Dropping the scoped actor terminates it normally.
pub struct ScopedActor {
    #[allow(dead_code)]
    system: ActorSystem,
    cell: Arc<ActorCell>,
}

impl ScopedActor {
    pub(crate) fn new(system: ActorSystem, cell: Arc<ActorCell>) -> ScopedActor {
        ScopedActor { system, cell }
    }

    pub fn addr(&self) -> ActorAddr {
        self.cell.addr()
    }

    pub fn self_ref(&self) -> ActorRef {
        ActorRef::from_cell(Arc::clone(&self.cell))
    }

    /// Asynchronous send carrying this actor as sender.
    pub fn send(&self, dest: &ActorRef, msg: impl IntoMessage) {
        dest.enqueue(Envelope::asynchronous(
            Some(self.cell.addr()),
            msg.into_message(),
        ));
    }

    /// Synchronous request: send, then park until the response, an
    /// error, the receiver's down notification, or the timeout.
    ///
    /// The deadline is armed with the clock like any actor-side
    /// request: it fires as an urgent-band error response, with the
    /// wall-clock wait below as a backstop. Unrelated elements
    /// received while waiting are put back in arrival order.
    pub fn request(
        &self,
        dest: &ActorRef,
        timeout: Duration,
        msg: impl IntoMessage,
    ) -> Result<Message, Error> {
        let mid = self.cell.next_request_id(MessagePriority::Normal);
        let dest_addr = dest.addr();
        dest.cell().add_monitor(self.cell.addr());
        dest.enqueue(Envelope::request(self.cell.addr(), mid, msg.into_message()));
        if let Some(system) = self.cell.system() {
            system
                .clock()
                .schedule(timeout, self.cell.addr(), timeout_response(mid));
        }

        let deadline = Instant::now() + timeout;
        let mut put_back: Vec<Envelope> = Vec::new();
        let result = loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => break Err(Error::sec(SecCode::RequestTimeout)),
            };
            if !self.cell.mailbox().wait_nonempty(Some(remaining)) {
                break Err(Error::sec(SecCode::RequestTimeout));
            }
            let Some(env) = self.cell.mailbox().try_pop() else {
                continue;
            };
            // Match by counter: the synthesized deadline carries the
            // same counter with urgent priority bits.
            if env.mid.is_response() && env.mid.request_counter() == mid.request_counter() {
                if env.content.is_error() {
                    let err = env
                        .content
                        .get::<Error>(0)
                        .cloned()
                        .unwrap_or_else(|| Error::sec(SecCode::UnexpectedMessage));
                    break Err(err);
                }
                break Ok(env.content);
            }
            if env.content.len() == 1 {
                if let Some(down) = env.content.get::<DownMsg>(0) {
                    if down.source == dest_addr {
                        break Err(Error::sec(SecCode::RequestReceiverDown));
                    }
                }
            }
            put_back.push(env);
        };
        self.cell.mailbox().prepend(put_back);
        dest.cell().remove_monitor(&self.cell.addr());
        result
    }

    /// Pop the next element, parking up to `timeout` for one to
    /// arrive. `None` means the wait timed out.
    pub fn receive(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(env) = self.cell.mailbox().try_pop() {
                return Some(env);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if !self.cell.mailbox().wait_nonempty(Some(remaining)) {
                return None;
            }
        }
    }
}

impl Drop for ScopedActor {
    fn drop(&mut self) {
        self.cell.terminate(ExitReason::Normal);
    }
}

impl std::fmt::Debug for ScopedActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedActor")
            .field("id", &self.cell.id())
            .finish()
    }
}
