//! Proxies: local forwarding stand-ins for remote actors.
//!
//! A proxy is an ordinary actor whose identity equals the remote
//! actor's `(node, id)` pair and whose behavior relays every mailbox
//! element to the BASP broker as a [`DispatchCmd`]. Local code can
//! send, request, link and monitor a proxy exactly like a local actor;
//! the broker turns relayed envelopes into `dispatch-message` frames.
//!
//! The registry is partitioned by node. Each remote actor referenced
//! locally has exactly one proxy; proxies die when the remote actor is
//! reported down (`kill-proxy`) or the node becomes unreachable.

use hive_core::{
    ActorAddr, ActorId, ActorRef, ActorSystem, Atom, Behavior, Context, Deserializer, Error,
    ExitReason, HandlerResult, Message, NodeId, SecCode, Serializer, UserType,
};
use hive_core::sysmsg::{DownMsg, ExitMsg};
use hive_core::user_message_type;
use rustc_hash::FxHashMap;

use crate::basp::header::flags;

// ---------------------------------------------------------------------------
// DispatchCmd
// ---------------------------------------------------------------------------

/// A relayed envelope on its way to the wire.
///
/// Process-local by contract: proxies send it to their broker, which
/// serializes the *content* (not the command) into a BASP frame.
#[derive(Clone, PartialEq, Debug)]
pub struct DispatchCmd {
    /// Originating actor, if the envelope carried one.
    pub source: Option<ActorAddr>,
    /// Remote destination; for named receivers the actor id holds the
    /// name atom.
    pub dest_node: NodeId,
    pub dest_actor: ActorId,
    /// Raw message id of the relayed envelope.
    pub mid_raw: u64,
    /// BASP header flags to set on the frame.
    pub flags: u8,
    /// Forwarding stages of the relayed envelope.
    pub stages: Vec<ActorAddr>,
    /// The payload tuple.
    pub content: Message,
}

impl UserType for DispatchCmd {
    const NAME: &'static str = "hive.net.dispatch_cmd";

    fn serialize(&self, _sink: &mut dyn Serializer) -> Result<(), Error> {
        // Never leaves the process; the broker unpacks it instead.
        Err(Error::sec(SecCode::InvalidArgument))
    }

    fn deserialize(_source: &mut dyn Deserializer) -> Result<Self, Error> {
        Err(Error::sec(SecCode::InvalidArgument))
    }
}

user_message_type!(DispatchCmd);

// ---------------------------------------------------------------------------
// Forwarding behavior
// ---------------------------------------------------------------------------

/// Relay the current element to `broker` as a [`DispatchCmd`].
fn relay(ctx: &mut Context<'_>, broker: &ActorRef, header_flags: u8, dest_actor: ActorId) {
    let cmd = DispatchCmd {
        source: ctx.sender().cloned(),
        dest_node: ctx.self_addr().node(),
        dest_actor,
        mid_raw: ctx.message_id().raw(),
        flags: header_flags,
        stages: ctx.stages().iter().map(|stage| stage.addr()).collect(),
        content: ctx.message().clone(),
    };
    ctx.send(broker, (cmd,));
}

/// The proxy behavior: forward everything, including exit and down
/// messages (exact handlers keep the runtime from interpreting them
/// locally), and never auto-reply -- responses come back over the
/// wire.
fn forwarding_behavior(broker: ActorRef, header_flags: u8) -> Behavior {
    let exit_broker = broker.clone();
    let down_broker = broker.clone();
    Behavior::new()
        .on::<(ExitMsg,), _>(move |ctx, _msg| {
            let dest = ctx.self_addr().id();
            relay(ctx, &exit_broker, header_flags, dest);
            HandlerResult::Async
        })
        .on::<(DownMsg,), _>(move |ctx, _msg| {
            let dest = ctx.self_addr().id();
            relay(ctx, &down_broker, header_flags, dest);
            HandlerResult::Async
        })
        .on_any(move |ctx, _msg| {
            let dest = ctx.self_addr().id();
            relay(ctx, &broker, header_flags, dest);
            HandlerResult::Async
        })
}

// ---------------------------------------------------------------------------
// ProxyRegistry
// ---------------------------------------------------------------------------

/// Per-node table of forwarding actors, owned by the BASP broker.
pub struct ProxyRegistry {
    nodes: FxHashMap<NodeId, FxHashMap<ActorId, ActorRef>>,
    /// Stand-ins addressing *named* actors on a peer; keyed by the
    /// name atom. Kept apart from real proxies since atom values and
    /// actor ids share the u64 space.
    named: FxHashMap<(NodeId, u64), ActorRef>,
}

impl ProxyRegistry {
    pub fn new() -> ProxyRegistry {
        ProxyRegistry {
            nodes: FxHashMap::default(),
            named: FxHashMap::default(),
        }
    }

    pub fn get(&self, node: NodeId, aid: ActorId) -> Option<ActorRef> {
        self.nodes.get(&node).and_then(|m| m.get(&aid)).cloned()
    }

    /// Get or create the proxy for `(node, aid)`. The boolean reports
    /// creation, which obliges the caller to announce the proxy to the
    /// remote node.
    pub fn get_or_create(
        &mut self,
        system: &ActorSystem,
        broker: &ActorRef,
        node: NodeId,
        aid: ActorId,
    ) -> (ActorRef, bool) {
        if let Some(existing) = self.get(node, aid) {
            return (existing, false);
        }
        let broker = broker.clone();
        let proxy = system.spawn_with_identity(node, aid, move |_ctx| {
            forwarding_behavior(broker, 0)
        });
        self.nodes.entry(node).or_default().insert(aid, proxy.clone());
        tracing::debug!(%node, aid, "created proxy");
        (proxy, true)
    }

    /// Get or create the stand-in for the named actor `name` on
    /// `node`. Named stand-ins are never announced.
    pub fn get_or_create_named(
        &mut self,
        system: &ActorSystem,
        broker: &ActorRef,
        node: NodeId,
        name: Atom,
    ) -> ActorRef {
        if let Some(existing) = self.named.get(&(node, name.as_u64())) {
            return existing.clone();
        }
        let broker = broker.clone();
        let proxy = system.spawn_with_identity(node, name.as_u64(), move |_ctx| {
            forwarding_behavior(broker, flags::NAMED_RECEIVER)
        });
        self.named.insert((node, name.as_u64()), proxy.clone());
        proxy
    }

    /// Kill one proxy with `reason`. Returns whether it existed.
    pub fn erase(&mut self, node: NodeId, aid: ActorId, reason: ExitReason) -> bool {
        let Some(proxies) = self.nodes.get_mut(&node) else {
            return false;
        };
        let Some(proxy) = proxies.remove(&aid) else {
            return false;
        };
        if proxies.is_empty() {
            self.nodes.remove(&node);
        }
        proxy.kill(reason);
        true
    }

    /// Kill every proxy of `node`, e.g. when its connection is lost
    /// beyond recovery. Returns the number killed.
    pub fn erase_node(&mut self, node: NodeId, reason: ExitReason) -> usize {
        let mut killed = 0;
        if let Some(proxies) = self.nodes.remove(&node) {
            for (_, proxy) in proxies {
                proxy.kill(reason);
                killed += 1;
            }
        }
        let stale: Vec<(NodeId, u64)> = self
            .named
            .keys()
            .filter(|(n, _)| *n == node)
            .copied()
            .collect();
        for key in stale {
            if let Some(proxy) = self.named.remove(&key) {
                proxy.kill(reason);
                killed += 1;
            }
        }
        killed
    }

    /// Kill everything, at middleman teardown.
    pub fn clear(&mut self, reason: ExitReason) {
        let nodes: Vec<NodeId> = self.nodes.keys().copied().collect();
        for node in nodes {
            self.erase_node(node, reason);
        }
        for (_, proxy) in std::mem::take(&mut self.named) {
            proxy.kill(reason);
        }
    }

    pub fn count(&self, node: NodeId) -> usize {
        self.nodes.get(&node).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("nodes", &self.nodes.len())
            .field("named", &self.named.len())
            .finish()
    }
}
