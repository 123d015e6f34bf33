//! Behaviors: ordered handler lists with optional timeouts.
//!
//! A behavior is a finite list of typed handlers. Dispatch walks the
//! list in declaration order and invokes the first handler whose type
//! signature matches the inbound message (first-fit). Handlers return a
//! [`HandlerResult`] describing what happens next: keep going, reply,
//! switch behavior, skip the element, or quit.
//!
//! `after(duration, action)` attaches a single-shot timeout to the
//! behavior; it fires when the mailbox stays empty for the given span
//! after a resume.

use std::time::Duration;

use crate::actor::Context;
use crate::error::{Error, ExitReason};
use crate::message::Message;
use crate::types::{StaticType, TypeToken};

// ---------------------------------------------------------------------------
// HandlerResult
// ---------------------------------------------------------------------------

/// Outcome of one handler invocation.
pub enum HandlerResult {
    /// Keep the current behavior. For a request, an empty response is
    /// synthesized unless a response promise was captured.
    Continue,
    /// Answer the current message with the given payload.
    Reply(Message),
    /// A response promise was captured; the reply comes later.
    Async,
    /// Leave the element for a later behavior (moves it to the stash;
    /// re-delivered after the next behavior change).
    Skip,
    /// Replace the active behavior.
    Become(Behavior),
    /// Push a new behavior, keeping the current one underneath.
    BecomeKept(Behavior),
    /// Pop the active behavior; quitting with `Normal` when the stack
    /// empties.
    Unbecome,
    /// Terminate the actor with the given reason.
    Quit(ExitReason),
    /// Deliver an error to the sender as the response of the current
    /// message. Does not terminate the actor.
    Fail(Error),
}

impl std::fmt::Debug for HandlerResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HandlerResult::Continue => "Continue",
            HandlerResult::Reply(_) => "Reply",
            HandlerResult::Async => "Async",
            HandlerResult::Skip => "Skip",
            HandlerResult::Become(_) => "Become",
            HandlerResult::BecomeKept(_) => "BecomeKept",
            HandlerResult::Unbecome => "Unbecome",
            HandlerResult::Quit(_) => "Quit",
            HandlerResult::Fail(_) => "Fail",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// DefaultHandler
// ---------------------------------------------------------------------------

/// Policy for elements no handler matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DefaultHandler {
    /// Log the element and drop it; requests receive an
    /// `unexpected-message` error response.
    #[default]
    PrintAndDrop,
    /// Stash the element for a later behavior.
    Skip,
    /// Send the element back to its sender.
    Reflect,
    /// Send the element back, then quit normally.
    ReflectAndQuit,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

type HandlerFn = Box<dyn FnMut(&mut Context<'_>, &Message) -> HandlerResult + Send>;
type TimeoutFn = Box<dyn FnMut(&mut Context<'_>) -> HandlerResult + Send>;

enum HandlerMatch {
    Exact(Vec<TypeToken>),
    Any,
}

struct Handler {
    pattern: HandlerMatch,
    run: HandlerFn,
}

impl Handler {
    fn matches(&self, msg: &Message) -> bool {
        match &self.pattern {
            HandlerMatch::Exact(signature) => msg.matches(signature),
            HandlerMatch::Any => true,
        }
    }
}

// ---------------------------------------------------------------------------
// MessagePattern
// ---------------------------------------------------------------------------

/// Compile-time type signature of a handler, implemented for tuples of
/// element types.
pub trait MessagePattern {
    fn signature() -> Vec<TypeToken>;
}

macro_rules! tuple_pattern {
    ($($name:ident),+) => {
        impl<$($name: StaticType),+> MessagePattern for ($($name,)+) {
            fn signature() -> Vec<TypeToken> {
                vec![$($name::type_token()),+]
            }
        }
    };
}

impl MessagePattern for () {
    fn signature() -> Vec<TypeToken> {
        Vec::new()
    }
}

tuple_pattern!(A);
tuple_pattern!(A, B);
tuple_pattern!(A, B, C);
tuple_pattern!(A, B, C, D);
tuple_pattern!(A, B, C, D, E);
tuple_pattern!(A, B, C, D, E, F);
tuple_pattern!(A, B, C, D, E, F, G);
tuple_pattern!(A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// Ordered handler list plus an optional timeout.
#[derive(Default)]
pub struct Behavior {
    handlers: Vec<Handler>,
    timeout: Option<(Duration, TimeoutFn)>,
}

impl Behavior {
    pub fn new() -> Behavior {
        Behavior::default()
    }

    /// Append a handler for messages matching the pattern `P`, e.g.
    /// `behavior.on::<(Atom, i64), _>(|ctx, msg| ...)`.
    pub fn on<P, F>(mut self, f: F) -> Behavior
    where
        P: MessagePattern,
        F: FnMut(&mut Context<'_>, &Message) -> HandlerResult + Send + 'static,
    {
        self.handlers.push(Handler {
            pattern: HandlerMatch::Exact(P::signature()),
            run: Box::new(f),
        });
        self
    }

    /// Append a handler with a runtime-built signature.
    pub fn on_signature<F>(mut self, signature: Vec<TypeToken>, f: F) -> Behavior
    where
        F: FnMut(&mut Context<'_>, &Message) -> HandlerResult + Send + 'static,
    {
        self.handlers.push(Handler {
            pattern: HandlerMatch::Exact(signature),
            run: Box::new(f),
        });
        self
    }

    /// Append a catch-all handler. Catch-alls never trap exit or down
    /// messages; those require an exact handler.
    pub fn on_any<F>(mut self, f: F) -> Behavior
    where
        F: FnMut(&mut Context<'_>, &Message) -> HandlerResult + Send + 'static,
    {
        self.handlers.push(Handler {
            pattern: HandlerMatch::Any,
            run: Box::new(f),
        });
        self
    }

    /// Attach the single-shot idle timeout.
    pub fn after<F>(mut self, duration: Duration, f: F) -> Behavior
    where
        F: FnMut(&mut Context<'_>) -> HandlerResult + Send + 'static,
    {
        self.timeout = Some((duration, Box::new(f)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.timeout.is_none()
    }

    /// Timeout duration, if one is attached.
    pub(crate) fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.as_ref().map(|(d, _)| *d)
    }

    /// Whether an exact (non-catch-all) handler matches `msg`. Used for
    /// exit/down trapping decisions.
    pub(crate) fn traps(&self, msg: &Message) -> bool {
        self.handlers.iter().any(|h| match &h.pattern {
            HandlerMatch::Exact(signature) => msg.matches(signature),
            HandlerMatch::Any => false,
        })
    }

    /// First-fit dispatch. Returns `None` when no handler matches.
    pub(crate) fn invoke(
        &mut self,
        ctx: &mut Context<'_>,
        msg: &Message,
    ) -> Option<HandlerResult> {
        for handler in self.handlers.iter_mut() {
            if handler.matches(msg) {
                return Some((handler.run)(ctx, msg));
            }
        }
        None
    }

    /// Run the timeout action.
    pub(crate) fn invoke_timeout(&mut self, ctx: &mut Context<'_>) -> Option<HandlerResult> {
        self.timeout.as_mut().map(|(_, f)| f(ctx))
    }
}

impl std::fmt::Debug for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior")
            .field("handlers", &self.handlers.len())
            .field("timeout", &self.timeout.as_ref().map(|(d, _)| *d))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;

    use crate::message::IntoMessage;

    #[test]
    fn test_pattern_signatures() {
        let sig = <(Atom, i64)>::signature();
        assert_eq!(sig.len(), 2);
        assert!((Atom::new("x"), 1i64).into_message().matches(&sig));
    }

    #[test]
    fn test_first_fit_order() {
        // Two handlers with the same signature: declaration order wins.
        let b = Behavior::new()
            .on::<(i64,), _>(|_, _| HandlerResult::Quit(ExitReason::UserShutdown))
            .on::<(i64,), _>(|_, _| HandlerResult::Continue);
        assert_eq!(b.handlers.len(), 2);
        let msg = (1i64,).into_message();
        assert!(b.handlers[0].matches(&msg));
    }

    #[test]
    fn test_traps_ignores_catch_all() {
        let b = Behavior::new().on_any(|_, _| HandlerResult::Continue);
        let msg = (1i64,).into_message();
        assert!(!b.traps(&msg));
        let b = Behavior::new().on::<(i64,), _>(|_, _| HandlerResult::Continue);
        assert!(b.traps(&msg));
    }
}
