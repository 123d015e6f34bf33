//! Mailbox elements.
//!
//! Every delivered message travels inside an [`Envelope`] carrying its
//! metadata: the sender (held weakly, promoted only when a reply is
//! produced), the request correlation id, and the pipeline of
//! forwarding stages still to run. Envelopes are created per send and
//! consumed exactly once by the receiver.

use crate::actor::{ActorAddr, ActorRef};
use crate::message::Message;
use crate::mid::{MessageId, MessagePriority};

/// One mailbox element: payload plus delivery metadata.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Originating actor, if any. Weak by design: a reply element must
    /// not keep its requester alive.
    pub sender: Option<ActorAddr>,
    /// Request correlation id; `MessageId::NONE` for asynchronous
    /// messages.
    pub mid: MessageId,
    /// Pipeline stages still to visit. Replies route to the last stage
    /// when present.
    pub stages: Vec<ActorRef>,
    /// The payload tuple.
    pub content: Message,
}

impl Envelope {
    /// An asynchronous (normal band) element.
    pub fn asynchronous(sender: Option<ActorAddr>, content: Message) -> Envelope {
        Envelope {
            sender,
            mid: MessageId::NONE,
            stages: Vec::new(),
            content,
        }
    }

    /// An asynchronous element in the urgent band.
    pub fn urgent(sender: Option<ActorAddr>, content: Message) -> Envelope {
        Envelope {
            sender,
            mid: MessageId::urgent(),
            stages: Vec::new(),
            content,
        }
    }

    /// A request element expecting a response under `mid`.
    pub fn request(sender: ActorAddr, mid: MessageId, content: Message) -> Envelope {
        debug_assert!(mid.is_request());
        Envelope {
            sender: Some(sender),
            mid,
            stages: Vec::new(),
            content,
        }
    }

    /// A response element answering request `request_mid`.
    pub fn response(
        sender: Option<ActorAddr>,
        request_mid: MessageId,
        content: Message,
    ) -> Envelope {
        Envelope {
            sender,
            mid: request_mid.response_id(),
            stages: Vec::new(),
            content,
        }
    }

    pub fn with_stages(mut self, stages: Vec<ActorRef>) -> Envelope {
        self.stages = stages;
        self
    }

    /// Band selector for the mailbox.
    pub fn priority(&self) -> MessagePriority {
        self.mid.priority()
    }
}
