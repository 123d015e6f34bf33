//! Strong and weak actor handles.
//!
//! Identity is the `(node, id)` pair for both handle types; equality
//! and hashing never look at the control block pointer. An
//! [`ActorAddr`] with a dead (or absent) weak pointer still names the
//! actor, it just cannot deliver to it.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::actor::cell::ActorCell;
use crate::actor::ActorId;
use crate::envelope::Envelope;
use crate::error::{Error, ExitReason};
use crate::message::{IntoMessage, MessageValue};
use crate::node::NodeId;
use crate::serial::{Deserializer, Serializer};
use crate::sysmsg::TerminateMsg;
use crate::types::{type_nr, StaticType, TypeToken};

// ---------------------------------------------------------------------------
// ActorAddr
// ---------------------------------------------------------------------------

/// Weak actor handle: `(node, id)` plus a weak control-block pointer.
///
/// Addresses are a builtin message element type; on the wire they carry
/// only the identity pair, so a deserialized address is unbound until
/// the network layer rebinds it through a proxy.
#[derive(Clone)]
pub struct ActorAddr {
    node: NodeId,
    id: ActorId,
    cell: Weak<ActorCell>,
}

impl ActorAddr {
    pub(crate) fn new(node: NodeId, id: ActorId, cell: Weak<ActorCell>) -> ActorAddr {
        ActorAddr { node, id, cell }
    }

    /// An unbound address naming an actor with no reachable control
    /// block (e.g. parsed off the wire).
    pub fn unbound(node: NodeId, id: ActorId) -> ActorAddr {
        ActorAddr {
            node,
            id,
            cell: Weak::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Promote to a strong handle, if the actor is still alive.
    pub fn upgrade(&self) -> Option<ActorRef> {
        self.cell.upgrade().map(ActorRef::from_cell)
    }

    pub(crate) fn serialize_body(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(NodeId::WIRE_SIZE);
        self.node.write_to(&mut buf);
        sink.write_raw(&buf)?;
        sink.write_u64(self.id)
    }

    pub(crate) fn deserialize_body(source: &mut dyn Deserializer) -> Result<ActorAddr, Error> {
        let bytes = source.read_raw(NodeId::WIRE_SIZE)?;
        let (node, _) = NodeId::read_from(&bytes)
            .ok_or(Error::sec(crate::error::SecCode::UnexpectedEof))?;
        let id = source.read_u64()?;
        Ok(ActorAddr::unbound(node, id))
    }
}

impl PartialEq for ActorAddr {
    fn eq(&self, other: &ActorAddr) -> bool {
        self.node == other.node && self.id == other.id
    }
}

impl Eq for ActorAddr {}

impl Hash for ActorAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for ActorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorAddr({}/{})", self.node, self.id)
    }
}

impl fmt::Display for ActorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.id)
    }
}

impl StaticType for ActorAddr {
    fn type_token() -> TypeToken {
        TypeToken::builtin(type_nr::ACTOR_ADDR)
    }
}

impl MessageValue for ActorAddr {
    fn token(&self) -> TypeToken {
        <ActorAddr as StaticType>::type_token()
    }

    fn eq_value(&self, other: &dyn MessageValue) -> bool {
        other
            .as_any()
            .downcast_ref::<ActorAddr>()
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

// ---------------------------------------------------------------------------
// ActorRef
// ---------------------------------------------------------------------------

/// Strong actor handle; keeps the control block alive.
#[derive(Clone)]
pub struct ActorRef {
    cell: Arc<ActorCell>,
}

impl ActorRef {
    pub(crate) fn from_cell(cell: Arc<ActorCell>) -> ActorRef {
        ActorRef { cell }
    }

    pub(crate) fn cell(&self) -> &Arc<ActorCell> {
        &self.cell
    }

    pub fn id(&self) -> ActorId {
        self.cell.id()
    }

    pub fn node(&self) -> NodeId {
        self.cell.node()
    }

    pub fn addr(&self) -> ActorAddr {
        self.cell.addr()
    }

    /// Deliver a mailbox element, scheduling the actor when it was
    /// parked. Elements for terminated actors are dropped; monitors
    /// still observe the recorded exit reason.
    pub fn enqueue(&self, env: Envelope) {
        self.cell.enqueue(env);
    }

    /// Anonymous asynchronous send.
    pub fn send(&self, msg: impl IntoMessage) {
        self.enqueue(Envelope::asynchronous(None, msg.into_message()));
    }

    /// Anonymous asynchronous send in the urgent band.
    pub fn send_urgent(&self, msg: impl IntoMessage) {
        self.enqueue(Envelope::urgent(None, msg.into_message()));
    }

    /// Force termination with `reason`. Delivered in the urgent band
    /// and never absorbed or trapped.
    pub fn kill(&self, reason: ExitReason) {
        self.enqueue(Envelope::urgent(None, (TerminateMsg { reason },).into_message()));
    }

    pub fn is_terminated(&self) -> bool {
        self.cell.is_terminated()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.cell.exit_reason()
    }

    /// Attach a one-shot hook that runs with the exit reason when the
    /// actor terminates (immediately, if it already has).
    pub fn attach(&self, hook: Box<dyn FnOnce(ExitReason) + Send>) {
        self.cell.attach(hook);
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &ActorRef) -> bool {
        self.node() == other.node() && self.id() == other.id()
    }
}

impl Eq for ActorRef {}

impl Hash for ActorRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node().hash(state);
        self.id().hash(state);
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef({}/{})", self.node(), self.id())
    }
}
