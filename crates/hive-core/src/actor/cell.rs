//! The actor control block and its resume/dispatch/terminate logic.
//!
//! One [`ActorCell`] holds everything that makes an actor: identity,
//! mailbox, behavior stack, stash, link and monitor sets, attach hooks,
//! and the pending-response table. Workers drive it through
//! [`ActorCell::resume`], which consumes mailbox elements until the
//! mailbox empties, the throughput budget runs out, or the actor quits.
//!
//! ## Locking discipline
//!
//! The mutable state sits behind one mutex, but handlers never run with
//! it held: dispatch pops the active behavior out of the stack, runs
//! the handler lock-free, then reapplies it together with whatever
//! transition the handler requested. Context methods re-lock briefly.
//! Only the owning worker dispatches, so popping is safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::actor::address::{ActorAddr, ActorRef};
use crate::actor::context::Context;
use crate::actor::ActorId;
use crate::behavior::{Behavior, DefaultHandler, HandlerResult};
use crate::envelope::Envelope;
use crate::error::{Error, ExitReason, SecCode};
use crate::mailbox::{EnqueueResult, Mailbox};
use crate::message::{IntoMessage, Message};
use crate::mid::{MessageId, MessagePriority};
use crate::request::PendingResponse;
use crate::sched::SchedulerHandle;
use crate::sysmsg::{DownMsg, ExitMsg, TerminateMsg, TimeoutMsg};
use crate::system::SystemCore;

/// Result of one resume step, as reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    /// Mailbox empty; the actor parked itself. Do not re-enqueue: the
    /// next push schedules it again.
    Awaiting,
    /// Throughput budget exhausted with work left; re-enqueue.
    ResumeLater,
    /// The actor terminated.
    Done,
}

/// How the cell gets execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulingMode {
    /// Run by the shared scheduler.
    Scheduled,
    /// Owns a dedicated OS thread.
    Detached,
    /// Driven manually by its owner (scoped actors).
    Manual,
}

type AttachHook = Box<dyn FnOnce(ExitReason) + Send>;
type ExitHook = Box<dyn FnOnce(&mut Context<'_>, ExitReason) + Send>;

pub(crate) struct CellState {
    behaviors: Vec<Behavior>,
    stash: Vec<Envelope>,
    links: FxHashSet<ActorAddr>,
    monitors: FxHashSet<ActorAddr>,
    hooks: Vec<AttachHook>,
    pub(crate) pending: FxHashMap<u64, PendingResponse>,
    request_counter: u64,
    armed_timeout: Option<u64>,
    timeout_seq: u64,
    pub(crate) default_handler: DefaultHandler,
    exit_hook: Option<ExitHook>,
    exit_reason: Option<ExitReason>,
}

impl CellState {
    pub(crate) fn set_exit_hook(&mut self, hook: ExitHook) {
        self.exit_hook = Some(hook);
    }
}

/// The actor control block.
pub struct ActorCell {
    id: ActorId,
    node: crate::node::NodeId,
    mailbox: Mailbox,
    mode: SchedulingMode,
    sched: SchedulerHandle,
    system: Weak<SystemCore>,
    /// Whether this cell occupies a slot in the local registry (false
    /// for proxies spawned with a foreign identity).
    registered: bool,
    /// Stand-in cells (proxies) issue no requests of their own;
    /// inbound responses skip the pending-response correlation and go
    /// to the behavior, which relays them.
    relays_responses: bool,
    terminated: AtomicBool,
    pub(crate) state: Mutex<CellState>,
}

enum InvokeOutcome {
    Continue,
    Terminate(ExitReason),
}

impl ActorCell {
    pub(crate) fn new(
        node: crate::node::NodeId,
        id: ActorId,
        system: Weak<SystemCore>,
        sched: SchedulerHandle,
        mode: SchedulingMode,
        registered: bool,
        relays_responses: bool,
    ) -> Arc<ActorCell> {
        Arc::new(ActorCell {
            id,
            node,
            mailbox: Mailbox::new(),
            mode,
            sched,
            system,
            registered,
            relays_responses,
            terminated: AtomicBool::new(false),
            state: Mutex::new(CellState {
                behaviors: Vec::new(),
                stash: Vec::new(),
                links: FxHashSet::default(),
                monitors: FxHashSet::default(),
                hooks: Vec::new(),
                pending: FxHashMap::default(),
                request_counter: 0,
                armed_timeout: None,
                timeout_seq: 0,
                default_handler: DefaultHandler::default(),
                exit_hook: None,
                exit_reason: None,
            }),
        })
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn node(&self) -> crate::node::NodeId {
        self.node
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.state.lock().exit_reason
    }

    pub(crate) fn addr(self: &Arc<Self>) -> ActorAddr {
        ActorAddr::new(self.node, self.id, Arc::downgrade(self))
    }

    pub(crate) fn system(&self) -> Option<Arc<SystemCore>> {
        self.system.upgrade()
    }

    /// Install the initial behavior at spawn time.
    pub(crate) fn push_initial_behavior(&self, behavior: Behavior) {
        self.state.lock().behaviors.push(behavior);
    }

    /// Transition a fresh (blocked) mailbox to open before an eager
    /// first schedule, so the first push does not double-schedule.
    pub(crate) fn open_mailbox(&self) {
        self.mailbox.reopen();
    }

    // -- delivery ----------------------------------------------------------

    /// Deliver one element, scheduling the actor when it was parked.
    pub(crate) fn enqueue(self: &Arc<Self>, env: Envelope) {
        match self.mailbox.push(env) {
            EnqueueResult::Enqueued => {}
            EnqueueResult::BecameUnblocked => self.schedule(),
            EnqueueResult::Dropped(_) => {
                // Terminated receiver: monitors were already notified
                // during cleanup, the element is discarded.
            }
        }
    }

    fn schedule(self: &Arc<Self>) {
        match self.mode {
            SchedulingMode::Scheduled => self.sched.schedule(Arc::clone(self)),
            // Detached and manual cells wake through the mailbox
            // condvar, which push already signalled.
            SchedulingMode::Detached | SchedulingMode::Manual => {}
        }
    }

    // -- monitors / links / hooks -----------------------------------------

    /// Register `observer` for a down notification. Monitoring a
    /// terminated actor fires immediately with the recorded reason.
    pub(crate) fn add_monitor(self: &Arc<Self>, observer: ActorAddr) {
        let fire = {
            let mut state = self.state.lock();
            match state.exit_reason {
                Some(reason) => Some(reason),
                None => {
                    state.monitors.insert(observer.clone());
                    None
                }
            }
        };
        if let Some(reason) = fire {
            if let Some(observer) = observer.upgrade() {
                let down = DownMsg {
                    source: self.addr(),
                    reason,
                };
                observer.enqueue(Envelope::asynchronous(None, (down,).into_message()));
            }
        }
    }

    pub(crate) fn remove_monitor(&self, observer: &ActorAddr) {
        self.state.lock().monitors.remove(observer);
    }

    /// One-sided link insertion. Linking to a terminated actor fires
    /// the exit signal at `peer` immediately.
    pub(crate) fn add_link(self: &Arc<Self>, peer: ActorAddr) {
        let fire = {
            let mut state = self.state.lock();
            match state.exit_reason {
                Some(reason) => Some(reason),
                None => {
                    state.links.insert(peer.clone());
                    None
                }
            }
        };
        if let Some(reason) = fire {
            if let Some(peer) = peer.upgrade() {
                let exit = ExitMsg {
                    source: self.addr(),
                    reason,
                };
                peer.enqueue(Envelope::urgent(None, (exit,).into_message()));
            }
        }
    }

    pub(crate) fn remove_link(&self, peer: &ActorAddr) {
        self.state.lock().links.remove(peer);
    }

    /// Attach a cleanup hook; runs (once) with the exit reason, or
    /// immediately if the actor already terminated.
    pub fn attach(&self, hook: AttachHook) {
        let fire = {
            let mut state = self.state.lock();
            match state.exit_reason {
                Some(reason) => Some((hook, reason)),
                None => {
                    state.hooks.push(hook);
                    None
                }
            }
        };
        if let Some((hook, reason)) = fire {
            hook(reason);
        }
    }

    // -- request plumbing --------------------------------------------------

    pub(crate) fn next_request_id(&self, priority: MessagePriority) -> MessageId {
        let mut state = self.state.lock();
        state.request_counter += 1;
        MessageId::request(state.request_counter, priority)
    }

    // -- resume loop -------------------------------------------------------

    /// Run up to `max_throughput` mailbox elements.
    pub fn resume(self: &Arc<Self>, max_throughput: usize) -> ResumeResult {
        if self.is_terminated() {
            return ResumeResult::Done;
        }
        let system = match self.system.upgrade() {
            Some(system) => system,
            None => {
                // The system is tearing down; finish quietly.
                self.terminate(ExitReason::UserShutdown);
                return ResumeResult::Done;
            }
        };
        let mut handled = 0;
        while handled < max_throughput {
            if self.is_terminated() {
                return ResumeResult::Done;
            }
            match self.mailbox.try_pop() {
                Some(env) => {
                    handled += 1;
                    match self.invoke(&system, env) {
                        InvokeOutcome::Continue => {}
                        InvokeOutcome::Terminate(reason) => {
                            self.terminate(reason);
                            return ResumeResult::Done;
                        }
                    }
                }
                None => {
                    if self.mailbox.try_block() {
                        self.arm_behavior_timeout(&system);
                        return ResumeResult::Awaiting;
                    }
                    // A push raced in between pop and block; loop.
                }
            }
        }
        ResumeResult::ResumeLater
    }

    /// Arm the active behavior's `after` timeout, if any. Called with
    /// an empty mailbox right before parking.
    fn arm_behavior_timeout(self: &Arc<Self>, system: &Arc<SystemCore>) {
        let armed = {
            let mut state = self.state.lock();
            let duration = state
                .behaviors
                .last()
                .and_then(|b| b.timeout_duration());
            duration.map(|d| {
                state.timeout_seq += 1;
                state.armed_timeout = Some(state.timeout_seq);
                (d, state.timeout_seq)
            })
        };
        if let Some((duration, id)) = armed {
            let env = Envelope::urgent(None, (TimeoutMsg { id },).into_message());
            system.clock().schedule(duration, self.addr(), env);
        }
    }

    // -- dispatch ----------------------------------------------------------

    fn invoke(self: &Arc<Self>, system: &Arc<SystemCore>, env: Envelope) -> InvokeOutcome {
        // Forced termination bypasses everything.
        if env.content.len() == 1 {
            if let Some(t) = env.content.get::<TerminateMsg>(0) {
                return InvokeOutcome::Terminate(t.reason);
            }
        }

        // Behavior timeout tick.
        if env.content.len() == 1 {
            if let Some(tm) = env.content.get::<TimeoutMsg>(0) {
                let valid = {
                    let mut state = self.state.lock();
                    if state.armed_timeout == Some(tm.id) {
                        state.armed_timeout = None;
                        true
                    } else {
                        false
                    }
                };
                if valid && self.mailbox.is_empty() {
                    return self.run_timeout(system);
                }
                return InvokeOutcome::Continue;
            }
        }

        // Any real message invalidates an armed timeout.
        self.state.lock().armed_timeout = None;

        // Response to an outstanding request. Stand-in cells own no
        // requests; their behavior relays responses like anything
        // else.
        if env.mid.is_response() && !self.relays_responses {
            let entry = self
                .state
                .lock()
                .pending
                .remove(&env.mid.request_counter());
            return match entry {
                Some(entry) => self.run_continuation(system, entry, &env),
                // Late response or timeout duplicate: drop.
                None => InvokeOutcome::Continue,
            };
        }

        // Exit signal from a linked actor.
        if env.content.len() == 1 {
            if let Some(exit) = env.content.get::<ExitMsg>(0) {
                if exit.reason == ExitReason::Kill {
                    return InvokeOutcome::Terminate(ExitReason::Kill);
                }
                let trapped = self
                    .state
                    .lock()
                    .behaviors
                    .last()
                    .is_some_and(|b| b.traps(&env.content));
                if !trapped {
                    return if exit.reason.cascades() {
                        InvokeOutcome::Terminate(exit.reason)
                    } else {
                        InvokeOutcome::Continue
                    };
                }
                // Trapped: fall through to regular dispatch.
            }
        }

        // Down notification: complete pending requests first.
        if env.content.len() == 1 {
            if let Some(down) = env.content.get::<DownMsg>(0).cloned() {
                let completed = {
                    let mut state = self.state.lock();
                    let keys: Vec<u64> = state
                        .pending
                        .iter()
                        .filter(|(_, p)| p.dest == down.source)
                        .map(|(k, _)| *k)
                        .collect();
                    keys.into_iter()
                        .filter_map(|k| state.pending.remove(&k))
                        .collect::<Vec<_>>()
                };
                for entry in completed {
                    let outcome = self.run_error_continuation(
                        system,
                        entry,
                        Error::sec(SecCode::RequestReceiverDown),
                        &env,
                    );
                    if let InvokeOutcome::Terminate(reason) = outcome {
                        return InvokeOutcome::Terminate(reason);
                    }
                }
                let observed = self
                    .state
                    .lock()
                    .behaviors
                    .last()
                    .is_some_and(|b| b.traps(&env.content));
                if !observed {
                    return InvokeOutcome::Continue;
                }
                // Monitored explicitly: fall through to dispatch.
            }
        }

        self.dispatch(system, env)
    }

    fn dispatch(self: &Arc<Self>, system: &Arc<SystemCore>, env: Envelope) -> InvokeOutcome {
        let behavior = self.state.lock().behaviors.pop();
        let Some(mut behavior) = behavior else {
            return InvokeOutcome::Terminate(ExitReason::Normal);
        };
        let mut ctx = Context::new(self, system, &env);
        match behavior.invoke(&mut ctx, &env.content) {
            Some(result) => {
                let result = ctx.resolve(result);
                let flags = ctx.flags();
                self.apply_result(Some(behavior), env, result, flags)
            }
            None => {
                self.state.lock().behaviors.push(behavior);
                self.apply_default_handler(env)
            }
        }
    }

    fn run_timeout(self: &Arc<Self>, system: &Arc<SystemCore>) -> InvokeOutcome {
        let behavior = self.state.lock().behaviors.pop();
        let Some(mut behavior) = behavior else {
            return InvokeOutcome::Terminate(ExitReason::Normal);
        };
        let env = Envelope::asynchronous(None, Message::empty());
        let mut ctx = Context::new(self, system, &env);
        let result = behavior
            .invoke_timeout(&mut ctx)
            .unwrap_or(HandlerResult::Continue);
        let result = ctx.resolve(result);
        let flags = ctx.flags();
        self.apply_result(Some(behavior), env, result, flags)
    }

    fn run_continuation(
        self: &Arc<Self>,
        system: &Arc<SystemCore>,
        entry: PendingResponse,
        env: &Envelope,
    ) -> InvokeOutcome {
        let mut ctx = Context::new(self, system, env);
        let result = if env.content.is_error() {
            let err = env
                .content
                .get::<Error>(0)
                .cloned()
                .unwrap_or_else(|| Error::sec(SecCode::UnexpectedMessage));
            match entry.on_err {
                Some(f) => f(&mut ctx, err),
                None => {
                    tracing::debug!(actor = self.id, "request failed without error handler");
                    HandlerResult::Continue
                }
            }
        } else {
            match entry.on_ok {
                Some(f) => f(&mut ctx, &env.content),
                None => HandlerResult::Continue,
            }
        };
        let result = ctx.resolve(result);
        let flags = ctx.flags();
        self.apply_result(None, env.clone(), result, flags)
    }

    fn run_error_continuation(
        self: &Arc<Self>,
        system: &Arc<SystemCore>,
        entry: PendingResponse,
        err: Error,
        env: &Envelope,
    ) -> InvokeOutcome {
        let mut ctx = Context::new(self, system, env);
        let result = match entry.on_err {
            Some(f) => f(&mut ctx, err),
            None => HandlerResult::Continue,
        };
        let result = ctx.resolve(result);
        let flags = ctx.flags();
        self.apply_result(None, env.clone(), result, flags)
    }

    /// Apply a handler's outcome. `popped` is the behavior taken off
    /// the stack for dispatch (`None` for continuations, which run
    /// against the intact stack).
    fn apply_result(
        self: &Arc<Self>,
        popped: Option<Behavior>,
        env: Envelope,
        result: HandlerResult,
        flags: super::context::DispatchFlags,
    ) -> InvokeOutcome {
        let restore = |behavior: Option<Behavior>| {
            if let Some(b) = behavior {
                self.state.lock().behaviors.push(b);
            }
        };
        match result {
            HandlerResult::Continue => {
                restore(popped);
                if env.mid.is_request() && !flags.promised && !flags.forwarded {
                    self.reply(&env, Message::empty());
                }
                InvokeOutcome::Continue
            }
            HandlerResult::Reply(msg) => {
                restore(popped);
                self.reply(&env, msg);
                InvokeOutcome::Continue
            }
            HandlerResult::Async => {
                restore(popped);
                InvokeOutcome::Continue
            }
            HandlerResult::Skip => {
                restore(popped);
                self.state.lock().stash.push(env);
                InvokeOutcome::Continue
            }
            HandlerResult::Become(next) => {
                {
                    let mut state = self.state.lock();
                    if popped.is_none() {
                        // Continuation path: replace the current top.
                        state.behaviors.pop();
                    }
                    state.behaviors.push(next);
                }
                self.unstash();
                InvokeOutcome::Continue
            }
            HandlerResult::BecomeKept(next) => {
                restore(popped);
                self.state.lock().behaviors.push(next);
                self.unstash();
                InvokeOutcome::Continue
            }
            HandlerResult::Unbecome => {
                // The popped behavior is dropped; for continuations pop
                // the current top instead.
                let empty = {
                    let mut state = self.state.lock();
                    if popped.is_none() {
                        state.behaviors.pop();
                    }
                    state.behaviors.is_empty()
                };
                self.unstash();
                if empty {
                    InvokeOutcome::Terminate(ExitReason::Normal)
                } else {
                    InvokeOutcome::Continue
                }
            }
            HandlerResult::Quit(reason) => InvokeOutcome::Terminate(reason),
            HandlerResult::Fail(err) => {
                restore(popped);
                if env.mid.is_request() {
                    self.reply(&env, (err,).into_message());
                } else {
                    tracing::debug!(actor = self.id, error = %err, "handler error dropped");
                }
                InvokeOutcome::Continue
            }
        }
    }

    fn apply_default_handler(self: &Arc<Self>, env: Envelope) -> InvokeOutcome {
        let policy = self.state.lock().default_handler;
        match policy {
            DefaultHandler::PrintAndDrop => {
                tracing::debug!(actor = self.id, content = ?env.content, "unexpected message");
                if env.mid.is_request() {
                    self.reply(&env, (Error::sec(SecCode::UnexpectedMessage),).into_message());
                }
                InvokeOutcome::Continue
            }
            DefaultHandler::Skip => {
                self.state.lock().stash.push(env);
                InvokeOutcome::Continue
            }
            DefaultHandler::Reflect => {
                self.reflect(env);
                InvokeOutcome::Continue
            }
            DefaultHandler::ReflectAndQuit => {
                self.reflect(env);
                InvokeOutcome::Terminate(ExitReason::Normal)
            }
        }
    }

    fn reflect(self: &Arc<Self>, env: Envelope) {
        let Some(sender) = env.sender.as_ref().and_then(|s| s.upgrade()) else {
            return;
        };
        if env.mid.is_request() {
            sender.enqueue(Envelope::response(Some(self.addr()), env.mid, env.content));
        } else {
            sender.enqueue(Envelope::asynchronous(Some(self.addr()), env.content));
        }
    }

    /// Route a response for `env`: last pending stage first, then the
    /// sender.
    pub(crate) fn reply(self: &Arc<Self>, env: &Envelope, msg: Message) {
        if !env.mid.is_request() {
            return;
        }
        let target = env
            .stages
            .last()
            .cloned()
            .or_else(|| env.sender.as_ref().and_then(|s| s.upgrade()));
        if let Some(target) = target {
            target.enqueue(Envelope::response(Some(self.addr()), env.mid, msg));
        }
    }

    fn unstash(&self) {
        let stash = std::mem::take(&mut self.state.lock().stash);
        self.mailbox.prepend(stash);
    }

    // -- termination -------------------------------------------------------

    /// Terminate with `reason`. Idempotent; the first caller wins and
    /// runs cleanup: exit hook, mailbox drain, link/monitor fan-out,
    /// attach hooks, registry release.
    pub(crate) fn terminate(self: &Arc<Self>, reason: ExitReason) {
        {
            let mut state = self.state.lock();
            if state.exit_reason.is_some() {
                return;
            }
            state.exit_reason = Some(reason);
        }
        self.terminated.store(true, Ordering::Release);
        let system = self.system.upgrade();

        // Exit hook runs before any notification goes out.
        let exit_hook = self.state.lock().exit_hook.take();
        if let Some(hook) = exit_hook {
            if let Some(system) = &system {
                if reason != ExitReason::Kill {
                    let env = Envelope::asynchronous(None, Message::empty());
                    let mut ctx = Context::new(self, system, &env);
                    hook(&mut ctx, reason);
                }
            }
        }

        // Drain the mailbox; outstanding requests get receiver-down.
        for env in self.mailbox.close() {
            if env.mid.is_request() {
                self.reply(&env, (Error::sec(SecCode::RequestReceiverDown),).into_message());
            }
        }

        let (links, monitors, hooks) = {
            let mut state = self.state.lock();
            state.behaviors.clear();
            state.stash.clear();
            state.pending.clear();
            (
                std::mem::take(&mut state.links),
                std::mem::take(&mut state.monitors),
                std::mem::take(&mut state.hooks),
            )
        };

        let addr = self.addr();
        for peer in links {
            if let Some(peer) = peer.upgrade() {
                let exit = ExitMsg {
                    source: addr.clone(),
                    reason,
                };
                peer.enqueue(Envelope::urgent(None, (exit,).into_message()));
            }
        }
        for observer in monitors {
            if let Some(observer) = observer.upgrade() {
                let down = DownMsg {
                    source: addr.clone(),
                    reason,
                };
                observer.enqueue(Envelope::asynchronous(None, (down,).into_message()));
            }
        }
        for hook in hooks {
            hook(reason);
        }

        if let Some(system) = system {
            if self.registered {
                system.registry().erase(self.id);
            }
        }
    }
}

impl std::fmt::Debug for ActorCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorCell")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
