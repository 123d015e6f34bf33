//! Message ids: request correlation tokens.
//!
//! A message id is a single `u64` with three packed fields:
//!
//! ```text
//! [1 bit response flag | 2 bit priority | 61 bit request counter]
//!  bit 63                bits 62..61      bits 60..0
//! ```
//!
//! The zero id marks an asynchronous message. A request carries a fresh
//! nonzero counter; its response carries the same counter with the
//! response flag set. The priority bits select the mailbox band and are
//! meaningful for asynchronous messages too (urgent sends use a nonzero
//! id with a zero counter).

use std::fmt;

const RESPONSE_FLAG: u64 = 1 << 63;
const PRIORITY_SHIFT: u32 = 61;
const PRIORITY_MASK: u64 = 0b11 << PRIORITY_SHIFT;
const COUNTER_MASK: u64 = (1 << PRIORITY_SHIFT) - 1;

/// Mailbox band selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MessagePriority {
    #[default]
    Normal,
    Urgent,
}

impl MessagePriority {
    fn bits(self) -> u64 {
        match self {
            MessagePriority::Normal => 0,
            MessagePriority::Urgent => 1,
        }
    }
}

/// Request correlation token, `MessageId::NONE` for asynchronous sends.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(u64);

impl MessageId {
    /// The asynchronous (normal priority) id.
    pub const NONE: MessageId = MessageId(0);

    /// An asynchronous id in the urgent band.
    pub fn urgent() -> MessageId {
        MessageId(MessagePriority::Urgent.bits() << PRIORITY_SHIFT)
    }

    /// Build a request id from a per-actor counter. The counter must be
    /// nonzero; it is masked to 61 bits.
    pub fn request(counter: u64, priority: MessagePriority) -> MessageId {
        debug_assert!(counter & COUNTER_MASK != 0, "request counter must be nonzero");
        MessageId((counter & COUNTER_MASK) | (priority.bits() << PRIORITY_SHIFT))
    }

    pub fn from_raw(raw: u64) -> MessageId {
        MessageId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// The id of the response answering this request.
    pub fn response_id(self) -> MessageId {
        MessageId(self.0 | RESPONSE_FLAG)
    }

    /// The same id with its priority bits replaced. Used for
    /// runtime-synthesized completions (request deadlines) that must
    /// ride the urgent band regardless of the request's own band.
    pub fn with_priority(self, priority: MessagePriority) -> MessageId {
        MessageId((self.0 & !PRIORITY_MASK) | (priority.bits() << PRIORITY_SHIFT))
    }

    pub fn request_counter(self) -> u64 {
        self.0 & COUNTER_MASK
    }

    pub fn priority(self) -> MessagePriority {
        if (self.0 & PRIORITY_MASK) >> PRIORITY_SHIFT == 0 {
            MessagePriority::Normal
        } else {
            MessagePriority::Urgent
        }
    }

    pub fn is_response(self) -> bool {
        self.0 & RESPONSE_FLAG != 0
    }

    /// A request expecting an answer: nonzero counter, response flag
    /// clear.
    pub fn is_request(self) -> bool {
        !self.is_response() && self.request_counter() != 0
    }

    /// An asynchronous message: zero counter, response flag clear.
    pub fn is_async(self) -> bool {
        !self.is_response() && self.request_counter() == 0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async() {
            write!(f, "MessageId(async/{:?})", self.priority())
        } else {
            write!(
                f,
                "MessageId({}{}/{:?})",
                self.request_counter(),
                if self.is_response() { "r" } else { "" },
                self.priority()
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
