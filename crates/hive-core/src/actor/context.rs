//! The API surface handlers see while running.
//!
//! A [`Context`] is rebuilt for every dispatched element. It exposes
//! the actor's identity, the current element's metadata, and every
//! operation an actor may perform: sends, requests, spawns, behavior
//! transitions, link/monitor management, and name registration.
//!
//! Transitions requested through methods (e.g. [`Context::quit`]) are
//! buffered in the context and applied after the handler returns; a
//! non-`Continue` [`HandlerResult`] returned by the handler takes
//! precedence.

use std::sync::Arc;
use std::time::Duration;

use crate::actor::address::{ActorAddr, ActorRef};
use crate::actor::cell::ActorCell;
use crate::behavior::{DefaultHandler, HandlerResult};
use crate::envelope::Envelope;
use crate::error::{Error, ExitReason};
use crate::group::Group;
use crate::message::{IntoMessage, Message};
use crate::mid::{MessageId, MessagePriority};
use crate::request::{ErrorFn, PendingResponse, RequestHandle, ResponseFn, ResponsePromise};
use crate::system::{ActorSystem, SystemCore};

/// Per-dispatch flags the cell consults after the handler returns.
#[derive(Clone, Copy, Default)]
pub(crate) struct DispatchFlags {
    /// A response promise was captured; suppress the automatic empty
    /// response.
    pub promised: bool,
    /// The element was forwarded; the reply belongs to someone else.
    pub forwarded: bool,
}

/// Handler-side view of the running actor and the current element.
pub struct Context<'a> {
    cell: &'a Arc<ActorCell>,
    system: ActorSystem,
    sender: Option<ActorAddr>,
    mid: MessageId,
    stages: Vec<ActorRef>,
    content: Message,
    transition: Option<HandlerResult>,
    flags: DispatchFlags,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        cell: &'a Arc<ActorCell>,
        system: &Arc<SystemCore>,
        env: &Envelope,
    ) -> Context<'a> {
        Context {
            cell,
            system: ActorSystem::from_core(Arc::clone(system)),
            sender: env.sender.clone(),
            mid: env.mid,
            stages: env.stages.clone(),
            content: env.content.clone(),
            transition: None,
            flags: DispatchFlags::default(),
        }
    }

    // -- identity ----------------------------------------------------------

    pub fn self_ref(&self) -> ActorRef {
        ActorRef::from_cell(Arc::clone(self.cell))
    }

    pub fn self_addr(&self) -> ActorAddr {
        self.cell.addr()
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Sender of the current element, if it carried one.
    pub fn sender(&self) -> Option<&ActorAddr> {
        self.sender.as_ref()
    }

    /// Message id of the current element.
    pub fn message_id(&self) -> MessageId {
        self.mid
    }

    /// Payload of the current element.
    pub fn message(&self) -> &Message {
        &self.content
    }

    /// Forwarding stages of the current element.
    pub fn stages(&self) -> &[ActorRef] {
        &self.stages
    }

    // -- sending -----------------------------------------------------------

    /// Asynchronous send carrying this actor as sender.
    pub fn send(&self, dest: &ActorRef, msg: impl IntoMessage) {
        dest.enqueue(Envelope::asynchronous(
            Some(self.self_addr()),
            msg.into_message(),
        ));
    }

    /// Urgent-band asynchronous send.
    pub fn send_urgent(&self, dest: &ActorRef, msg: impl IntoMessage) {
        dest.enqueue(Envelope::urgent(Some(self.self_addr()), msg.into_message()));
    }

    /// Send to a weak address; silently dropped when the target is
    /// gone.
    pub fn send_to(&self, dest: &ActorAddr, msg: impl IntoMessage) {
        if let Some(dest) = dest.upgrade() {
            self.send(&dest, msg);
        }
    }

    /// Deliver `msg` to `dest` after `delay`. Clock deliveries arrive
    /// in the urgent band, ahead of queued normal traffic.
    pub fn delayed_send(&self, dest: &ActorRef, delay: Duration, msg: impl IntoMessage) {
        let env = Envelope::urgent(Some(self.self_addr()), msg.into_message());
        self.system.clock().schedule(delay, dest.addr(), env);
    }

    /// Send an exit signal, as if this actor terminated with `reason`.
    pub fn send_exit(&self, dest: &ActorRef, reason: ExitReason) {
        let exit = crate::sysmsg::ExitMsg {
            source: self.self_addr(),
            reason,
        };
        dest.enqueue(Envelope::urgent(Some(self.self_addr()), (exit,).into_message()));
    }

    // -- request/response --------------------------------------------------

    /// Issue a request with a fresh message id and a deadline.
    pub fn request(
        &mut self,
        dest: &ActorRef,
        timeout: Duration,
        msg: impl IntoMessage,
    ) -> RequestHandle<'_, 'a> {
        let mid = self.cell.next_request_id(MessagePriority::Normal);
        self.cell.state.lock().pending.insert(
            mid.request_counter(),
            PendingResponse {
                dest: dest.addr(),
                on_ok: None,
                on_err: None,
            },
        );
        // Monitor the destination so its termination completes the
        // request with `request-receiver-down`.
        dest.cell().add_monitor(self.self_addr());
        dest.enqueue(Envelope::request(self.self_addr(), mid, msg.into_message()));
        // The deadline rides the urgent band, independent of the
        // request's own priority bits.
        self.system
            .clock()
            .schedule(timeout, self.self_addr(), crate::request::timeout_response(mid));
        RequestHandle::new(self, mid)
    }

    pub(crate) fn install_continuation(
        &mut self,
        mid: MessageId,
        on_ok: Option<ResponseFn>,
        on_err: Option<ErrorFn>,
    ) {
        let mut state = self.cell.state.lock();
        if let Some(entry) = state.pending.get_mut(&mid.request_counter()) {
            entry.on_ok = on_ok;
            entry.on_err = on_err;
        }
    }

    /// Capture a promise for the current element; the handler should
    /// return [`HandlerResult::Async`].
    pub fn make_response_promise(&mut self) -> ResponsePromise {
        self.flags.promised = true;
        ResponsePromise::new(self.sender.clone(), self.self_addr(), self.mid)
    }

    /// Pass the current element on to `dest`, keeping sender, message
    /// id and stages intact. The reply, if any, flows from `dest` to
    /// the original sender.
    pub fn forward_to(&mut self, dest: &ActorRef) {
        self.flags.forwarded = true;
        dest.enqueue(Envelope {
            sender: self.sender.clone(),
            mid: self.mid,
            stages: std::mem::take(&mut self.stages),
            content: self.content.clone(),
        });
    }

    // -- spawning ----------------------------------------------------------

    pub fn spawn(&self, init: impl FnOnce(&mut Context<'_>) -> crate::behavior::Behavior) -> ActorRef {
        self.system.spawn(init)
    }

    // -- monitors and links ------------------------------------------------

    /// Observe `target`; one down message arrives on its termination.
    pub fn monitor(&self, target: &ActorRef) {
        target.cell().add_monitor(self.self_addr());
    }

    pub fn demonitor(&self, target: &ActorRef) {
        target.cell().remove_monitor(&self.self_addr());
    }

    /// Create a bidirectional link. Idempotent; linking to a
    /// terminated actor delivers the stored exit reason immediately.
    pub fn link_to(&self, target: &ActorRef) {
        self.cell.add_link(target.addr());
        target.cell().add_link(self.self_addr());
    }

    pub fn unlink_from(&self, target: &ActorRef) {
        self.cell.remove_link(&target.addr());
        target.cell().remove_link(&self.self_addr());
    }

    // -- behavior control --------------------------------------------------

    /// Request termination after the current handler returns.
    pub fn quit(&mut self, reason: ExitReason) {
        self.transition = Some(HandlerResult::Quit(reason));
    }

    /// Replace the policy for unmatched elements.
    pub fn set_default_handler(&self, policy: DefaultHandler) {
        self.cell.state.lock().default_handler = policy;
    }

    /// Install the exit hook, run before down/exit notifications go
    /// out (skipped on `kill`).
    pub fn set_exit_handler(
        &self,
        hook: impl FnOnce(&mut Context<'_>, ExitReason) + Send + 'static,
    ) {
        self.cell.state.lock().set_exit_hook(Box::new(hook));
    }

    // -- registry and groups -----------------------------------------------

    /// Register this actor under `name` in the local named registry.
    pub fn register(&self, name: &str) -> Result<(), Error> {
        self.system.registry().register_name(name, &self.self_ref())
    }

    pub fn unregister(&self, name: &str) {
        self.system.registry().unregister_name(name);
    }

    /// Subscribe to a local group.
    pub fn join(&self, group: &Group) {
        group.join(self.self_addr());
    }

    pub fn leave(&self, group: &Group) {
        group.leave(&self.self_addr());
    }

    // -- internal ----------------------------------------------------------

    /// Merge the buffered transition into the handler's returned
    /// result.
    pub(crate) fn resolve(&mut self, result: HandlerResult) -> HandlerResult {
        match result {
            HandlerResult::Continue => self.transition.take().unwrap_or(HandlerResult::Continue),
            other => other,
        }
    }

    pub(crate) fn flags(&self) -> DispatchFlags {
        self.flags
    }
}
