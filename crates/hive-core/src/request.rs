//! Request/response machinery: pending-response tables and response
//! promises.
//!
//! A request allocates a fresh message id, installs an entry in the
//! caller's pending-response table, and arms a deadline with the clock.
//! Exactly one of four things completes the entry: the matching
//! response, the synthesized timeout error, a receiver-down error, or
//! the caller's own termination (which discards the table).
//!
//! [`ResponsePromise`] decouples replying from returning: a handler may
//! capture the promise, return [`HandlerResult::Async`], and deliver
//! the reply later from any context.

use crate::actor::{ActorAddr, Context};
use crate::behavior::HandlerResult;
use crate::envelope::Envelope;
use crate::error::{Error, SecCode};
use crate::message::{IntoMessage, Message};
use crate::mid::{MessageId, MessagePriority};

/// The synthesized deadline completion for the request `mid`: a
/// `request-timeout` error response forced into the urgent band so a
/// fired deadline overtakes queued normal-priority traffic instead of
/// waiting behind it. Armed with the clock by every request path.
pub(crate) fn timeout_response(mid: MessageId) -> Envelope {
    Envelope::response(
        None,
        mid.with_priority(MessagePriority::Urgent),
        (Error::sec(SecCode::RequestTimeout),).into_message(),
    )
}

// ---------------------------------------------------------------------------
// PendingResponse
// ---------------------------------------------------------------------------

pub(crate) type ResponseFn =
    Box<dyn FnOnce(&mut Context<'_>, &Message) -> HandlerResult + Send>;
pub(crate) type ErrorFn = Box<dyn FnOnce(&mut Context<'_>, Error) -> HandlerResult + Send>;

/// One outstanding request, keyed in the cell by its request counter.
pub(crate) struct PendingResponse {
    /// The request's destination; down messages from it complete the
    /// entry with `request-receiver-down`.
    pub dest: ActorAddr,
    pub on_ok: Option<ResponseFn>,
    pub on_err: Option<ErrorFn>,
}

// ---------------------------------------------------------------------------
// RequestHandle
// ---------------------------------------------------------------------------

/// Future-like handle returned by [`Context::request`]; install
/// continuations with [`RequestHandle::then`].
pub struct RequestHandle<'s, 'c> {
    ctx: &'s mut Context<'c>,
    mid: MessageId,
}

impl<'s, 'c> RequestHandle<'s, 'c> {
    pub(crate) fn new(ctx: &'s mut Context<'c>, mid: MessageId) -> RequestHandle<'s, 'c> {
        RequestHandle { ctx, mid }
    }

    /// The request's message id.
    pub fn id(&self) -> MessageId {
        self.mid
    }

    /// Install success and error continuations. Without this call the
    /// response (or error) is dropped when it arrives.
    pub fn then<S, E>(self, on_ok: S, on_err: E)
    where
        S: FnOnce(&mut Context<'_>, &Message) -> HandlerResult + Send + 'static,
        E: FnOnce(&mut Context<'_>, Error) -> HandlerResult + Send + 'static,
    {
        self.ctx.install_continuation(
            self.mid,
            Some(Box::new(on_ok)),
            Some(Box::new(on_err)),
        );
    }
}

// ---------------------------------------------------------------------------
// ResponsePromise
// ---------------------------------------------------------------------------

/// Deferred reply to the message currently being handled.
///
/// Dropping an unfulfilled promise for a request delivers a
/// `broken-promise` error to the requester.
pub struct ResponsePromise {
    target: Option<ActorAddr>,
    source: ActorAddr,
    mid: MessageId,
    delivered: bool,
}

impl ResponsePromise {
    pub(crate) fn new(
        target: Option<ActorAddr>,
        source: ActorAddr,
        mid: MessageId,
    ) -> ResponsePromise {
        ResponsePromise {
            target,
            source,
            mid,
            delivered: false,
        }
    }

    /// Whether the handled message actually awaits a response.
    pub fn is_pending(&self) -> bool {
        !self.delivered && self.mid.is_request()
    }

    /// Send the reply.
    pub fn deliver(mut self, msg: impl IntoMessage) {
        self.do_deliver(msg.into_message());
    }

    /// Send an error reply.
    pub fn deliver_error(mut self, err: Error) {
        self.do_deliver((err,).into_message());
    }

    fn do_deliver(&mut self, msg: Message) {
        self.delivered = true;
        if !self.mid.is_request() {
            // Nobody is waiting; the value is discarded.
            return;
        }
        if let Some(target) = self.target.as_ref().and_then(|t| t.upgrade()) {
            target.enqueue(Envelope::response(Some(self.source.clone()), self.mid, msg));
        }
    }
}

impl Drop for ResponsePromise {
    fn drop(&mut self) {
        if !self.delivered && self.mid.is_request() {
            self.do_deliver((Error::sec(SecCode::BrokenPromise),).into_message());
        }
    }
}

impl std::fmt::Debug for ResponsePromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsePromise")
            .field("mid", &self.mid)
            .field("delivered", &self.delivered)
            .finish()
    }
}
