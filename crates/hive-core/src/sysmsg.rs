//! Runtime-internal message element types.
//!
//! These travel through regular mailboxes but are recognized by the
//! dispatch loop before behavior matching: exit messages drive link
//! propagation, down messages complete monitors and pending requests,
//! timeout messages fire behavior timeouts, and terminate messages
//! force termination (proxy kills, `ActorRef::kill`).
//!
//! `DownMsg` and `ExitMsg` are also matchable by behaviors, so actors
//! can observe peers or trap exits.

use std::any::Any;

use crate::actor::ActorAddr;
use crate::error::{Error, ExitReason, SecCode};
use crate::message::MessageValue;
use crate::serial::{Deserializer, Serializer};
use crate::types::{type_nr, StaticType, TypeToken};

// ---------------------------------------------------------------------------
// DownMsg
// ---------------------------------------------------------------------------

/// One-shot notification delivered to monitors when the observed actor
/// terminates.
#[derive(Clone, PartialEq, Debug)]
pub struct DownMsg {
    /// The terminated actor.
    pub source: ActorAddr,
    /// Its recorded exit reason.
    pub reason: ExitReason,
}

// ---------------------------------------------------------------------------
// ExitMsg
// ---------------------------------------------------------------------------

/// Exit signal delivered to linked actors on termination.
///
/// Without a matching handler, a non-`Normal` reason terminates the
/// receiver with the same reason; `Normal` is absorbed silently.
#[derive(Clone, PartialEq, Debug)]
pub struct ExitMsg {
    /// The terminated link partner.
    pub source: ActorAddr,
    /// Its recorded exit reason.
    pub reason: ExitReason,
}

// ---------------------------------------------------------------------------
// TimeoutMsg
// ---------------------------------------------------------------------------

/// Behavior timeout tick. The id must match the actor's currently armed
/// timeout; stale ticks are dropped.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TimeoutMsg {
    pub id: u64,
}

// ---------------------------------------------------------------------------
// TerminateMsg
// ---------------------------------------------------------------------------

/// Forced termination request, delivered in the urgent band.
///
/// Unlike an exit signal, a terminate message is never absorbed or
/// trapped; the receiver terminates with the given reason.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TerminateMsg {
    pub reason: ExitReason,
}

// ---------------------------------------------------------------------------
// MessageValue impls
// ---------------------------------------------------------------------------

fn serialize_reason(reason: ExitReason, sink: &mut dyn Serializer) -> Result<(), Error> {
    sink.write_u32(reason.code())
}

fn deserialize_reason(source: &mut dyn Deserializer) -> Result<ExitReason, Error> {
    let code = source.read_u32()?;
    ExitReason::from_code(code).ok_or(Error::sec(SecCode::MalformedBaspMessage))
}

macro_rules! sysmsg_value {
    ($ty:ty, $nr:expr) => {
        impl StaticType for $ty {
            fn type_token() -> TypeToken {
                TypeToken::builtin($nr)
            }
        }

        impl MessageValue for $ty {
            fn token(&self) -> TypeToken {
                <$ty as StaticType>::type_token()
            }

            fn eq_value(&self, other: &dyn MessageValue) -> bool {
                other
                    .as_any()
                    .downcast_ref::<$ty>()
                    .is_some_and(|v| v == self)
            }

            fn clone_value(&self) -> Box<dyn MessageValue> {
                Box::new(self.clone())
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }

            fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
                self.serialize_body(sink)
            }
        }
    };
}

sysmsg_value!(DownMsg, type_nr::DOWN_MSG);
sysmsg_value!(ExitMsg, type_nr::EXIT_MSG);
sysmsg_value!(TimeoutMsg, type_nr::TIMEOUT_MSG);
sysmsg_value!(TerminateMsg, type_nr::TERMINATE_MSG);

impl DownMsg {
    fn serialize_body(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        self.source.serialize_body(sink)?;
        serialize_reason(self.reason, sink)
    }

    pub(crate) fn deserialize_body(source: &mut dyn Deserializer) -> Result<DownMsg, Error> {
        let addr = ActorAddr::deserialize_body(source)?;
        let reason = deserialize_reason(source)?;
        Ok(DownMsg {
            source: addr,
            reason,
        })
    }
}

impl ExitMsg {
    fn serialize_body(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        self.source.serialize_body(sink)?;
        serialize_reason(self.reason, sink)
    }

    pub(crate) fn deserialize_body(source: &mut dyn Deserializer) -> Result<ExitMsg, Error> {
        let addr = ActorAddr::deserialize_body(source)?;
        let reason = deserialize_reason(source)?;
        Ok(ExitMsg {
            source: addr,
            reason,
        })
    }
}

impl TimeoutMsg {
    fn serialize_body(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        sink.write_u64(self.id)
    }
}

impl TerminateMsg {
    fn serialize_body(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        serialize_reason(self.reason, sink)
    }
}
