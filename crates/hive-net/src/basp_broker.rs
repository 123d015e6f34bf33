//! The BASP broker: the actor that owns the node's transport endpoints
//! and drives the protocol instance.
//!
//! Everything reaches the broker through its mailbox: transport events
//! from the multiplexer, relayed envelopes from proxies
//! ([`DispatchCmd`]), commands from the middleman (publish, connect,
//! lookup, stop), remote lookup requests from peer brokers, and its
//! own heartbeat/flush ticks.
//!
//! The broker state sits in one mutex shared by the handler closures;
//! the actor's single-consumer mailbox serializes all access, the lock
//! merely satisfies the `Send` bound.

use std::sync::Arc;
use std::time::Duration;

use hive_core::{
    ActorAddr, ActorRef, ActorSystem, Atom, Behavior, Context, Envelope, Error, ExitReason,
    HandlerResult, IntoMessage, Message, MessageId, NodeId, SecCode, SystemConfig,
};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::basp::instance::{Instance, InstanceCallee};
use crate::basp::routing::EndpointHandle;
use crate::broker::{
    AcceptorClosedMsg, Broker, ConnectionClosedMsg, DataTransferredMsg, DatagramClosedMsg,
    DatagramSentMsg, NewConnectionMsg, NewDataMsg, NewDatagramMsg,
};
use crate::mpx::{AcceptorHandle, DatagramHandle, MultiplexerPtr};
use crate::proxy::{DispatchCmd, ProxyRegistry};

/// Deadline for the ConfigServ query during automatic connection.
const AUTO_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for remote name lookups.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// ConfigServ key under which a node publishes its reachable endpoint.
pub const CONNECTIVITY_KEY: &str = "basp.endpoint";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

macro_rules! local_message_type {
    ($(#[$doc:meta])* $ty:ident { $($field:ident: $fty:ty),* $(,)? }, $name:literal) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Debug)]
        pub struct $ty {
            $(pub $field: $fty,)*
        }

        impl hive_core::UserType for $ty {
            const NAME: &'static str = $name;

            fn serialize(
                &self,
                _sink: &mut dyn hive_core::Serializer,
            ) -> Result<(), hive_core::Error> {
                // Process-local by contract.
                Err(hive_core::Error::sec(hive_core::SecCode::InvalidArgument))
            }

            fn deserialize(
                _source: &mut dyn hive_core::Deserializer,
            ) -> Result<Self, hive_core::Error> {
                Err(hive_core::Error::sec(hive_core::SecCode::InvalidArgument))
            }
        }

        hive_core::user_message_type!($ty);
    };
}

local_message_type! {
    /// Bind a doorman and publish `aid` on the bound port.
    PublishCmd { aid: u64, port: u16, reuse_addr: bool }, "hive.net.publish"
}

local_message_type! {
    /// Bind a local datagram endpoint and publish `aid` on it.
    PublishUdpCmd { aid: u64, port: u16 }, "hive.net.publish_udp"
}

local_message_type! {
    /// Release the doorman or datagram endpoint bound to `port`.
    UnpublishCmd { port: u16 }, "hive.net.unpublish"
}

local_message_type! {
    /// Open a stream connection and perform the handshake.
    ConnectCmd { host: String, port: u16 }, "hive.net.connect"
}

local_message_type! {
    /// Contact a peer over a datagram endpoint.
    ConnectUdpCmd { host: String, port: u16 }, "hive.net.connect_udp"
}

local_message_type! {
    /// Resolve `name` on `node` to a proxy.
    LookupCmd { node: NodeId, name: String }, "hive.net.lookup"
}

local_message_type! {
    /// Tear the broker down: close endpoints, kill proxies, quit.
    StopCmd {}, "hive.net.stop"
}

local_message_type! {
    /// A watched local actor terminated (attach hook fired).
    LocalDownMsg { aid: u64, code: u32 }, "hive.net.local_down"
}

local_message_type! {
    /// Pending-delivery timeout for a datagram endpoint.
    FlushTick { hdl: u64 }, "hive.net.flush_tick"
}

local_message_type! {
    /// Periodic heartbeat trigger.
    HeartbeatTick {}, "hive.net.heartbeat_tick"
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// BASP knobs, extracted from the system configuration.
#[derive(Clone, Copy, Debug)]
pub struct BaspConfig {
    pub window: u16,
    pub deliver_unordered: bool,
    pub auto_connect: bool,
    pub heartbeat: Option<Duration>,
    pub pending_delivery: Duration,
}

impl BaspConfig {
    pub fn from_system(config: &SystemConfig) -> BaspConfig {
        BaspConfig {
            window: config.middleman_reorder_window,
            deliver_unordered: config.middleman_deliver_unordered,
            auto_connect: config.middleman_enable_automatic_connections,
            heartbeat: config
                .middleman_enable_heartbeat
                .then(|| Duration::from_millis(config.middleman_heartbeat_interval_ms)),
            pending_delivery: Duration::from_millis(config.middleman_pending_delivery_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

struct PendingConnect {
    host: String,
    port: u16,
    udp: bool,
    promises: Vec<hive_core::ResponsePromise>,
}

enum Deferred {
    /// Connector-side handshake completed.
    Established {
        endpoint: EndpointHandle,
        node: NodeId,
        published: Option<u64>,
    },
    /// Report a (possibly long dead) local actor down to one watcher.
    NotifyDown {
        node: NodeId,
        aid: u64,
        reason: ExitReason,
    },
    /// Try to upgrade an indirect route with a direct connection.
    AutoConnect { node: NodeId },
}

struct Shared {
    self_ref: ActorRef,
    broker: Broker,
    proxies: ProxyRegistry,
    /// Local actor id -> peer nodes holding a proxy for it.
    watched: FxHashMap<u64, FxHashSet<NodeId>>,
    /// Actors with an installed down hook.
    hooked: FxHashSet<u64>,
    pending_connects: FxHashMap<EndpointHandle, PendingConnect>,
    published_tcp: FxHashMap<u16, (AcceptorHandle, u64)>,
    published_udp: FxHashMap<u16, (DatagramHandle, u64)>,
    acceptor_published: FxHashMap<AcceptorHandle, u64>,
    udp_parent_published: FxHashMap<DatagramHandle, u64>,
    /// Connector-side address book: (host, port) -> (node, published).
    known_peers: FxHashMap<(String, u16), (NodeId, Option<u64>)>,
    auto_connect: bool,
    auto_connect_started: FxHashSet<NodeId>,
    flush_scheduled: FxHashSet<DatagramHandle>,
    deferred: Vec<Deferred>,
    failed: Vec<(EndpointHandle, Error)>,
}

struct State {
    instance: Instance,
    shared: Shared,
}

type StatePtr = Arc<Mutex<State>>;

// ---------------------------------------------------------------------------
// InstanceCallee implementation
// ---------------------------------------------------------------------------

struct BrokerCallee<'a> {
    system: &'a ActorSystem,
    shared: &'a mut Shared,
}

impl InstanceCallee for BrokerCallee<'_> {
    fn system(&self) -> &ActorSystem {
        self.system
    }

    fn write(&mut self, endpoint: EndpointHandle, bytes: Vec<u8>) {
        let result = match endpoint {
            EndpointHandle::Stream(hdl) => self.shared.broker.write(hdl, bytes),
            EndpointHandle::Datagram(hdl) => self.shared.broker.write_datagram(hdl, bytes),
        };
        if let Err(err) = result {
            tracing::debug!(?endpoint, %err, "transport write failed");
            self.shared.failed.push((endpoint, err));
        }
    }

    fn deliver(
        &mut self,
        dest: ActorRef,
        sender: Option<ActorRef>,
        mid: MessageId,
        stages: Vec<ActorRef>,
        content: Message,
    ) {
        dest.enqueue(Envelope {
            sender: sender.map(|s| s.addr()),
            mid,
            stages,
            content,
        });
    }

    fn resolve_local(&mut self, aid: u64) -> Option<ActorRef> {
        self.system.registry().get(aid)
    }

    fn resolve_named(&mut self, name: Atom) -> Option<ActorRef> {
        self.system.registry().get_named(&name.text())
    }

    fn proxy(&mut self, node: NodeId, aid: u64) -> Option<(ActorRef, bool)> {
        let self_ref = self.shared.self_ref.clone();
        Some(self
            .shared
            .proxies
            .get_or_create(self.system, &self_ref, node, aid))
    }

    fn kill_proxy(&mut self, node: NodeId, aid: u64, reason: ExitReason) {
        self.shared.proxies.erase(node, aid, reason);
    }

    fn add_watcher(&mut self, aid: u64, watcher: NodeId) {
        self.shared.watched.entry(aid).or_default().insert(watcher);
        if !self.shared.hooked.insert(aid) {
            return;
        }
        match self.system.registry().get(aid) {
            Some(actor) => {
                let broker = self.shared.self_ref.clone();
                actor.attach(Box::new(move |reason| {
                    broker.send_urgent((LocalDownMsg {
                        aid,
                        code: reason.code(),
                    },));
                }));
            }
            None => {
                // Announced for an actor that is already gone.
                self.shared.deferred.push(Deferred::NotifyDown {
                    node: watcher,
                    aid,
                    reason: ExitReason::Normal,
                });
            }
        }
    }

    fn learned_new_node_directly(&mut self, node: NodeId) {
        tracing::debug!(%node, "direct path established");
    }

    fn learned_new_node_indirectly(&mut self, node: NodeId, hop: NodeId) {
        tracing::debug!(%node, via = %hop, "indirect path learned");
        if self.shared.auto_connect {
            self.shared.deferred.push(Deferred::AutoConnect { node });
        }
    }

    fn connection_established(
        &mut self,
        node: NodeId,
        endpoint: EndpointHandle,
        published: Option<u64>,
    ) {
        self.shared.deferred.push(Deferred::Established {
            endpoint,
            node,
            published,
        });
    }

    fn endpoint_failed(&mut self, endpoint: EndpointHandle, err: Error) {
        self.shared.failed.push((endpoint, err));
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the BASP broker for `system` on top of `mpx`.
pub fn spawn(system: &ActorSystem, mpx: MultiplexerPtr) -> ActorRef {
    let cfg = BaspConfig::from_system(system.config());
    system.spawn(move |ctx| {
        let self_ref = ctx.self_ref();
        let state: StatePtr = Arc::new(Mutex::new(State {
            instance: Instance::new(ctx.system().node(), cfg.window, cfg.deliver_unordered),
            shared: Shared {
                self_ref: self_ref.clone(),
                broker: Broker::new(mpx),
                proxies: ProxyRegistry::new(),
                watched: FxHashMap::default(),
                hooked: FxHashSet::default(),
                pending_connects: FxHashMap::default(),
                published_tcp: FxHashMap::default(),
                published_udp: FxHashMap::default(),
                acceptor_published: FxHashMap::default(),
                udp_parent_published: FxHashMap::default(),
                known_peers: FxHashMap::default(),
                auto_connect: cfg.auto_connect,
                auto_connect_started: FxHashSet::default(),
                flush_scheduled: FxHashSet::default(),
                deferred: Vec::new(),
                failed: Vec::new(),
            },
        }));
        if let Some(interval) = cfg.heartbeat {
            ctx.delayed_send(&self_ref, interval, (HeartbeatTick {},));
        }
        behavior(state, cfg)
    })
}

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

fn behavior(state: StatePtr, cfg: BaspConfig) -> Behavior {
    let b = Behavior::new();

    // -- transport events --------------------------------------------------
    let st = state.clone();
    let b = b.on::<(NewConnectionMsg,), _>(move |_ctx, msg| {
        let ev = msg.get::<NewConnectionMsg>(0).expect("event").clone();
        let mut guard = st.lock();
        let State { instance, shared } = &mut *guard;
        let published = shared.acceptor_published.get(&ev.source).copied();
        shared.broker.add_scribe(ev.handle);
        instance.add_accepted(EndpointHandle::Stream(ev.handle), published);
        HandlerResult::Continue
    });

    let st = state.clone();
    let b = b.on::<(NewDataMsg,), _>(move |ctx, msg| {
        let ev = msg.get::<NewDataMsg>(0).expect("event").clone();
        {
            let mut guard = st.lock();
            let State { instance, shared } = &mut *guard;
            let mut callee = BrokerCallee {
                system: ctx.system(),
                shared,
            };
            instance.handle_stream_data(&mut callee, EndpointHandle::Stream(ev.handle), &ev.buf.0);
        }
        post_process(ctx, &st, &cfg);
        HandlerResult::Continue
    });

    let st = state.clone();
    let b = b.on::<(NewDatagramMsg,), _>(move |ctx, msg| {
        let ev = msg.get::<NewDatagramMsg>(0).expect("event").clone();
        let need_flush = {
            let mut guard = st.lock();
            let State { instance, shared } = &mut *guard;
            let published = shared
                .udp_parent_published
                .get(&ev.source)
                .copied()
                .filter(|aid| *aid != 0);
            shared.broker.add_datagram(ev.handle);
            instance.add_accepted(EndpointHandle::Datagram(ev.handle), published);
            let mut callee = BrokerCallee {
                system: ctx.system(),
                shared,
            };
            instance.handle_datagram(&mut callee, ev.handle, &ev.buf.0);
            instance.has_pending_datagrams(ev.handle) && shared.flush_scheduled.insert(ev.handle)
        };
        if need_flush {
            ctx.delayed_send(
                &ctx.self_ref(),
                cfg.pending_delivery,
                (FlushTick { hdl: ev.handle.0 },),
            );
        }
        post_process(ctx, &st, &cfg);
        HandlerResult::Continue
    });

    let st = state.clone();
    let b = b.on::<(ConnectionClosedMsg,), _>(move |ctx, msg| {
        let ev = msg.get::<ConnectionClosedMsg>(0).expect("event").clone();
        close_endpoint(ctx, &st, EndpointHandle::Stream(ev.handle), None);
        HandlerResult::Continue
    });

    let st = state.clone();
    let b = b.on::<(DatagramClosedMsg,), _>(move |ctx, msg| {
        let ev = msg.get::<DatagramClosedMsg>(0).expect("event").clone();
        close_endpoint(ctx, &st, EndpointHandle::Datagram(ev.handle), None);
        HandlerResult::Continue
    });

    let st = state.clone();
    let b = b.on::<(AcceptorClosedMsg,), _>(move |_ctx, msg| {
        let ev = msg.get::<AcceptorClosedMsg>(0).expect("event").clone();
        let mut guard = st.lock();
        let shared = &mut guard.shared;
        shared.acceptor_published.remove(&ev.handle);
        if let Some(port) = shared.broker.forget_doorman(ev.handle) {
            shared.published_tcp.remove(&port);
        }
        HandlerResult::Continue
    });

    let b = b.on::<(DataTransferredMsg,), _>(|_ctx, _msg| HandlerResult::Continue);
    let b = b.on::<(DatagramSentMsg,), _>(|_ctx, _msg| HandlerResult::Continue);

    // -- proxy relays ------------------------------------------------------
    let st = state.clone();
    let b = b.on::<(DispatchCmd,), _>(move |ctx, msg| {
        let cmd = msg.get::<DispatchCmd>(0).expect("command").clone();
        let result = {
            let mut guard = st.lock();
            let State { instance, shared } = &mut *guard;
            let mut callee = BrokerCallee {
                system: ctx.system(),
                shared,
            };
            let stages: Vec<(NodeId, u64)> =
                cmd.stages.iter().map(|a| (a.node(), a.id())).collect();
            instance.dispatch(
                &mut callee,
                cmd.source.as_ref().map(|a| (a.node(), a.id())),
                cmd.dest_node,
                cmd.dest_actor,
                cmd.flags,
                cmd.mid_raw,
                &stages,
                &cmd.content,
            )
        };
        if let Err(err) = result {
            let mid = MessageId::from_raw(cmd.mid_raw);
            if mid.is_request() {
                // Complete the pending request with the routing error.
                if let Some(source) = cmd.source.as_ref().and_then(|a| a.upgrade()) {
                    source.enqueue(Envelope::response(None, mid, (err,).into_message()));
                }
            } else {
                tracing::debug!(dest = %cmd.dest_node, %err, "dropped outbound dispatch");
            }
        }
        post_process(ctx, &st, &cfg);
        HandlerResult::Continue
    });

    // -- remote lookup service (named-receiver "BASP") ---------------------
    let b = b.on::<(Atom, String), _>(move |ctx, msg| {
        let tag = *msg.get::<Atom>(0).expect("atom");
        let name = msg.get::<String>(1).expect("name").clone();
        if tag != Atom::new("lookup") {
            return HandlerResult::Fail(Error::sec(SecCode::UnexpectedMessage));
        }
        let aid = ctx
            .system()
            .registry()
            .get_named(&name)
            .map(|actor| actor.id())
            .unwrap_or(0);
        HandlerResult::Reply((aid,).into_message())
    });

    // -- middleman commands ------------------------------------------------
    let st = state.clone();
    let b = b.on::<(PublishCmd,), _>(move |_ctx, msg| {
        let cmd = msg.get::<PublishCmd>(0).expect("command").clone();
        let mut guard = st.lock();
        let shared = &mut guard.shared;
        let self_ref = shared.self_ref.clone();
        match shared.broker.new_tcp_doorman(cmd.port, cmd.reuse_addr, &self_ref) {
            Ok((hdl, bound)) => {
                shared.acceptor_published.insert(hdl, cmd.aid);
                shared.published_tcp.insert(bound, (hdl, cmd.aid));
                tracing::debug!(port = bound, aid = cmd.aid, "published actor");
                HandlerResult::Reply((bound,).into_message())
            }
            Err(err) => HandlerResult::Fail(err),
        }
    });

    let st = state.clone();
    let b = b.on::<(PublishUdpCmd,), _>(move |_ctx, msg| {
        let cmd = msg.get::<PublishUdpCmd>(0).expect("command").clone();
        let mut guard = st.lock();
        let shared = &mut guard.shared;
        let self_ref = shared.self_ref.clone();
        match shared.broker.new_udp_endpoint_local(cmd.port, &self_ref) {
            Ok((hdl, bound)) => {
                shared.udp_parent_published.insert(hdl, cmd.aid);
                shared.published_udp.insert(bound, (hdl, cmd.aid));
                HandlerResult::Reply((bound,).into_message())
            }
            Err(err) => HandlerResult::Fail(err),
        }
    });

    let st = state.clone();
    let b = b.on::<(UnpublishCmd,), _>(move |_ctx, msg| {
        let cmd = msg.get::<UnpublishCmd>(0).expect("command").clone();
        let mut guard = st.lock();
        let shared = &mut guard.shared;
        if let Some((hdl, _)) = shared.published_tcp.remove(&cmd.port) {
            shared.acceptor_published.remove(&hdl);
            shared.broker.close_doorman(hdl);
            return HandlerResult::Reply(Message::empty());
        }
        if let Some((hdl, _)) = shared.published_udp.remove(&cmd.port) {
            shared.udp_parent_published.remove(&hdl);
            shared.broker.close_datagram(hdl);
            return HandlerResult::Reply(Message::empty());
        }
        HandlerResult::Fail(Error::sec(SecCode::NoActorPublishedAtPort))
    });

    let st = state.clone();
    let b = b.on::<(ConnectCmd,), _>(move |ctx, msg| {
        let cmd = msg.get::<ConnectCmd>(0).expect("command").clone();
        let promise = ctx.make_response_promise();
        initiate_connect(ctx, &st, &cfg, cmd.host, cmd.port, false, Some(promise));
        HandlerResult::Async
    });

    let st = state.clone();
    let b = b.on::<(ConnectUdpCmd,), _>(move |ctx, msg| {
        let cmd = msg.get::<ConnectUdpCmd>(0).expect("command").clone();
        let promise = ctx.make_response_promise();
        initiate_connect(ctx, &st, &cfg, cmd.host, cmd.port, true, Some(promise));
        HandlerResult::Async
    });

    let st = state.clone();
    let b = b.on::<(LookupCmd,), _>(move |ctx, msg| {
        let cmd = msg.get::<LookupCmd>(0).expect("command").clone();
        let promise = ctx.make_response_promise();
        if cmd.node == ctx.system().node() {
            match ctx.system().registry().get_named(&cmd.name) {
                Some(actor) => promise.deliver((actor.addr(),)),
                None => promise.deliver_error(Error::sec(SecCode::InvalidArgument)),
            }
            return HandlerResult::Async;
        }
        let basp_proxy = {
            let mut guard = st.lock();
            let shared = &mut guard.shared;
            let self_ref = shared.self_ref.clone();
            shared
                .proxies
                .get_or_create_named(ctx.system(), &self_ref, cmd.node, Atom::new("BASP"))
        };
        let slot = Arc::new(Mutex::new(Some(promise)));
        let ok_slot = Arc::clone(&slot);
        let err_slot = Arc::clone(&slot);
        let ok_state = st.clone();
        let node = cmd.node;
        ctx.request(
            &basp_proxy,
            LOOKUP_TIMEOUT,
            (Atom::new("lookup"), cmd.name.clone()),
        )
        .then(
            move |ctx, reply| {
                let aid = reply.get::<u64>(0).copied().unwrap_or(0);
                let Some(promise) = ok_slot.lock().take() else {
                    return HandlerResult::Continue;
                };
                if aid == 0 {
                    promise.deliver_error(Error::sec(SecCode::InvalidArgument));
                    return HandlerResult::Continue;
                }
                let proxy = {
                    let mut guard = ok_state.lock();
                    let State { instance, shared } = &mut *guard;
                    let mut callee = BrokerCallee {
                        system: ctx.system(),
                        shared,
                    };
                    instance.get_proxy(&mut callee, node, aid)
                };
                match proxy {
                    Some(proxy) => promise.deliver((proxy.addr(),)),
                    None => promise.deliver_error(Error::sec(SecCode::CannotConnectToNode)),
                }
                HandlerResult::Continue
            },
            move |_ctx, err| {
                if let Some(promise) = err_slot.lock().take() {
                    promise.deliver_error(err);
                }
                HandlerResult::Continue
            },
        );
        HandlerResult::Async
    });

    let st = state.clone();
    let b = b.on::<(StopCmd,), _>(move |ctx, _msg| {
        let promise = ctx.make_response_promise();
        {
            let mut guard = st.lock();
            let shared = &mut guard.shared;
            shared.broker.close_all();
            shared.proxies.clear(ExitReason::RemoteLinkUnreachable);
            for (_, pending) in std::mem::take(&mut shared.pending_connects) {
                for p in pending.promises {
                    p.deliver_error(Error::sec(SecCode::CannotConnectToNode));
                }
            }
        }
        promise.deliver(());
        HandlerResult::Quit(ExitReason::Normal)
    });

    // -- internal ticks ----------------------------------------------------
    let st = state.clone();
    let b = b.on::<(LocalDownMsg,), _>(move |ctx, msg| {
        let down = msg.get::<LocalDownMsg>(0).expect("down").clone();
        let reason = ExitReason::from_code(down.code).unwrap_or(ExitReason::Normal);
        {
            let mut guard = st.lock();
            let State { instance, shared } = &mut *guard;
            let watchers = shared.watched.remove(&down.aid).unwrap_or_default();
            shared.hooked.remove(&down.aid);
            let mut callee = BrokerCallee {
                system: ctx.system(),
                shared,
            };
            for node in watchers {
                instance.send_kill_proxy(&mut callee, node, down.aid, reason);
            }
        }
        post_process(ctx, &st, &cfg);
        HandlerResult::Continue
    });

    let st = state.clone();
    let b = b.on::<(FlushTick,), _>(move |ctx, msg| {
        let tick = msg.get::<FlushTick>(0).expect("tick").clone();
        let hdl = DatagramHandle(tick.hdl);
        let reschedule = {
            let mut guard = st.lock();
            let State { instance, shared } = &mut *guard;
            shared.flush_scheduled.remove(&hdl);
            let mut callee = BrokerCallee {
                system: ctx.system(),
                shared,
            };
            instance.flush_pending(&mut callee, hdl);
            instance.has_pending_datagrams(hdl) && shared.flush_scheduled.insert(hdl)
        };
        if reschedule {
            ctx.delayed_send(
                &ctx.self_ref(),
                cfg.pending_delivery,
                (FlushTick { hdl: tick.hdl },),
            );
        }
        post_process(ctx, &st, &cfg);
        HandlerResult::Continue
    });

    let st = state.clone();
    let b = b.on::<(HeartbeatTick,), _>(move |ctx, _msg| {
        {
            let mut guard = st.lock();
            let State { instance, shared } = &mut *guard;
            let mut callee = BrokerCallee {
                system: ctx.system(),
                shared,
            };
            instance.send_heartbeats(&mut callee);
        }
        if let Some(interval) = cfg.heartbeat {
            ctx.delayed_send(&ctx.self_ref(), interval, (HeartbeatTick {},));
        }
        post_process(ctx, &st, &cfg);
        HandlerResult::Continue
    });

    b
}

// ---------------------------------------------------------------------------
// Connect / close helpers
// ---------------------------------------------------------------------------

fn initiate_connect(
    ctx: &mut Context<'_>,
    state: &StatePtr,
    cfg: &BaspConfig,
    host: String,
    port: u16,
    udp: bool,
    promise: Option<hive_core::ResponsePromise>,
) {
    initiate_connect_locked(ctx, state, host, port, udp, promise);
    post_process(ctx, state, cfg);
}

fn initiate_connect_locked(
    ctx: &mut Context<'_>,
    state: &StatePtr,
    host: String,
    port: u16,
    udp: bool,
    promise: Option<hive_core::ResponsePromise>,
) {
    let mut guard = state.lock();
    let State { instance, shared } = &mut *guard;

    // Already connected: answer from the address book. Two concurrent
    // calls for the same endpoint share one direct path.
    if let Some(&(node, published)) = shared.known_peers.get(&(host.clone(), port)) {
        if instance.routing().is_direct(node) {
            if let Some(promise) = promise {
                match published {
                    Some(aid) => {
                        let mut callee = BrokerCallee {
                            system: ctx.system(),
                            shared,
                        };
                        match instance.get_proxy(&mut callee, node, aid) {
                            Some(proxy) => promise.deliver((node, proxy.addr())),
                            None => {
                                promise.deliver_error(Error::sec(SecCode::CannotConnectToNode))
                            }
                        }
                    }
                    None => promise.deliver_error(Error::sec(SecCode::NoActorPublishedAtPort)),
                }
            }
            return;
        }
    }

    // A connect to the same endpoint is in flight: piggyback.
    if let Some(pending) = shared
        .pending_connects
        .values_mut()
        .find(|p| p.host == host && p.port == port && p.udp == udp)
    {
        if let Some(promise) = promise {
            pending.promises.push(promise);
        }
        return;
    }

    let self_ref = shared.self_ref.clone();
    let opened = if udp {
        shared
            .broker
            .new_udp_endpoint_remote(&host, port, &self_ref)
            .map(EndpointHandle::Datagram)
    } else {
        shared
            .broker
            .new_tcp_scribe(&host, port, &self_ref)
            .map(EndpointHandle::Stream)
    };
    match opened {
        Ok(endpoint) => {
            {
                let mut callee = BrokerCallee {
                    system: ctx.system(),
                    shared,
                };
                instance.start_connection(&mut callee, endpoint);
            }
            shared.pending_connects.insert(
                endpoint,
                PendingConnect {
                    host,
                    port,
                    udp,
                    promises: promise.into_iter().collect(),
                },
            );
        }
        Err(err) => {
            tracing::debug!(%host, port, %err, "connect failed");
            if let Some(promise) = promise {
                promise.deliver_error(err);
            }
        }
    }
}

fn close_endpoint(
    ctx: &mut Context<'_>,
    state: &StatePtr,
    endpoint: EndpointHandle,
    err: Option<Error>,
) {
    {
        let mut guard = state.lock();
        let State { instance, shared } = &mut *guard;
        match endpoint {
            EndpointHandle::Stream(hdl) => {
                shared.broker.close(hdl);
                shared.broker.forget(hdl);
            }
            EndpointHandle::Datagram(hdl) => {
                shared.broker.close_datagram(hdl);
                shared.broker.forget_datagram(hdl);
                shared.flush_scheduled.remove(&hdl);
            }
        }
        let erased = instance.endpoint_closed(endpoint);
        let mut lost = Vec::new();
        lost.extend(erased.direct);
        lost.extend(erased.indirect);
        for node in &lost {
            tracing::debug!(node = %node, "node became unreachable");
            shared
                .proxies
                .erase_node(*node, ExitReason::RemoteLinkUnreachable);
            shared.known_peers.retain(|_, (n, _)| n != node);
            shared.auto_connect_started.remove(node);
        }
        if let Some(pending) = shared.pending_connects.remove(&endpoint) {
            let err = err
                .clone()
                .filter(|e| !e.is_none())
                .unwrap_or_else(|| Error::sec(SecCode::CannotConnectToNode));
            for promise in pending.promises {
                promise.deliver_error(err.clone());
            }
        }
    }
    post_process_no_cfg(ctx, state);
}

// ---------------------------------------------------------------------------
// Deferred-action processing
// ---------------------------------------------------------------------------

fn post_process(ctx: &mut Context<'_>, state: &StatePtr, cfg: &BaspConfig) {
    loop {
        let (failed, deferred) = {
            let mut guard = state.lock();
            (
                std::mem::take(&mut guard.shared.failed),
                std::mem::take(&mut guard.shared.deferred),
            )
        };
        if failed.is_empty() && deferred.is_empty() {
            return;
        }
        for (endpoint, err) in failed {
            tracing::debug!(?endpoint, %err, "closing endpoint after protocol error");
            close_endpoint(ctx, state, endpoint, Some(err));
        }
        for action in deferred {
            match action {
                Deferred::Established {
                    endpoint,
                    node,
                    published,
                } => {
                    let mut guard = state.lock();
                    let State { instance, shared } = &mut *guard;
                    let Some(pending) = shared.pending_connects.remove(&endpoint) else {
                        continue;
                    };
                    shared
                        .known_peers
                        .insert((pending.host.clone(), pending.port), (node, published));
                    let reply: Result<(NodeId, ActorAddr), Error> = match published {
                        Some(aid) => {
                            let mut callee = BrokerCallee {
                                system: ctx.system(),
                                shared,
                            };
                            instance
                                .get_proxy(&mut callee, node, aid)
                                .map(|proxy| (node, proxy.addr()))
                                .ok_or_else(|| Error::sec(SecCode::CannotConnectToNode))
                        }
                        None => Err(Error::sec(SecCode::NoActorPublishedAtPort)),
                    };
                    for promise in pending.promises {
                        match &reply {
                            Ok((node, addr)) => promise.deliver((*node, addr.clone())),
                            Err(err) => promise.deliver_error(err.clone()),
                        }
                    }
                }
                Deferred::NotifyDown { node, aid, reason } => {
                    let mut guard = state.lock();
                    let State { instance, shared } = &mut *guard;
                    let mut callee = BrokerCallee {
                        system: ctx.system(),
                        shared,
                    };
                    instance.send_kill_proxy(&mut callee, node, aid, reason);
                }
                Deferred::AutoConnect { node } => {
                    start_auto_connect(ctx, state, cfg, node);
                }
            }
        }
    }
}

/// Deferred processing for paths that have no config at hand (pure
/// close-out; auto-connect is never triggered there).
fn post_process_no_cfg(ctx: &mut Context<'_>, state: &StatePtr) {
    let dummy = BaspConfig {
        window: 0,
        deliver_unordered: false,
        auto_connect: false,
        heartbeat: None,
        pending_delivery: Duration::from_millis(0),
    };
    post_process(ctx, state, &dummy);
}

/// Ask the freshly learned node's ConfigServ for a directly reachable
/// endpoint, then connect to it.
fn start_auto_connect(ctx: &mut Context<'_>, state: &StatePtr, cfg: &BaspConfig, node: NodeId) {
    let proxy = {
        let mut guard = state.lock();
        let shared = &mut guard.shared;
        if !shared.auto_connect || !shared.auto_connect_started.insert(node) {
            return;
        }
        let self_ref = shared.self_ref.clone();
        shared
            .proxies
            .get_or_create_named(ctx.system(), &self_ref, node, Atom::new("ConfigServ"))
    };
    tracing::debug!(%node, "querying connectivity for automatic connection");
    let ok_state = state.clone();
    let ok_cfg = *cfg;
    ctx.request(
        &proxy,
        AUTO_CONNECT_TIMEOUT,
        (Atom::new("get"), CONNECTIVITY_KEY.to_string()),
    )
    .then(
        move |ctx, reply| {
            let value = reply.get::<String>(1).cloned().unwrap_or_default();
            match parse_endpoint(&value) {
                Some((host, port)) => {
                    initiate_connect(ctx, &ok_state, &ok_cfg, host, port, false, None);
                }
                None => tracing::debug!(%value, "no usable connectivity information"),
            }
            HandlerResult::Continue
        },
        move |_ctx, err| {
            tracing::debug!(%err, "connectivity query failed");
            HandlerResult::Continue
        },
    );
}

/// Parse a "host:port" connectivity value.
fn parse_endpoint(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse().ok().map(|port| (host.to_string(), port))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("127.0.0.1:4242"),
            Some(("127.0.0.1".to_string(), 4242))
        );
        assert_eq!(parse_endpoint("host:0"), Some(("host".to_string(), 0)));
        assert_eq!(parse_endpoint(""), None);
        assert_eq!(parse_endpoint("nohost"), None);
        assert_eq!(parse_endpoint(":80"), None);
        assert_eq!(parse_endpoint("host:notaport"), None);
    }

    #[test]
    fn test_basp_config_from_system() {
        let mut sys_cfg = SystemConfig::default();
        sys_cfg.middleman_enable_heartbeat = true;
        sys_cfg.middleman_heartbeat_interval_ms = 500;
        sys_cfg.middleman_enable_automatic_connections = true;
        let cfg = BaspConfig::from_system(&sys_cfg);
        assert_eq!(cfg.window, 64);
        assert!(cfg.auto_connect);
        assert_eq!(cfg.heartbeat, Some(Duration::from_millis(500)));
        assert_eq!(cfg.pending_delivery, Duration::from_millis(100));
    }
}
