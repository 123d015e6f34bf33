//! The BASP instance: handshakes, dispatch, proxies, routing,
//! sequencing.
//!
//! The instance is the transport-agnostic protocol core. It lives
//! inside the BASP broker, processes raw transport bytes into frames,
//! and calls back into its owner through [`InstanceCallee`] for every
//! actor-level effect: delivering messages, creating and killing
//! proxies, resolving local and named actors, and writing bytes.
//!
//! Stream endpoints accumulate bytes until a full header (then a full
//! payload) is available -- the `AWAIT_HEADER`/`AWAIT_PAYLOAD` cycle.
//! Datagram endpoints carry exactly one frame per datagram, prefixed
//! with a sequence number that feeds the reorder buffer.

use hive_core::{
    ActorId, ActorRef, ActorSystem, Atom, BinaryDeserializer, BinarySerializer, Deserializer,
    Error, ExitReason, Message, MessageId, NodeId, SecCode, Serializer,
};
use rustc_hash::FxHashMap;

use crate::basp::header::{
    flags, Header, Operation, DATAGRAM_HEADER_SIZE, HEADER_SIZE, VERSION,
};
use crate::basp::ordering::{Arrival, OrderedDelivery, SequenceCounter};
use crate::basp::routing::{EndpointHandle, ErasedRoutes, Route, RoutingTable};
use crate::mpx::DatagramHandle;

// ---------------------------------------------------------------------------
// InstanceCallee
// ---------------------------------------------------------------------------

/// Actor-level effects the instance delegates to its owning broker.
pub trait InstanceCallee {
    fn system(&self) -> &ActorSystem;

    /// Queue raw bytes on a transport endpoint.
    fn write(&mut self, endpoint: EndpointHandle, bytes: Vec<u8>);

    /// Enqueue an inbound message onto a local actor.
    fn deliver(
        &mut self,
        dest: ActorRef,
        sender: Option<ActorRef>,
        mid: MessageId,
        stages: Vec<ActorRef>,
        content: Message,
    );

    /// Resolve a local actor id.
    fn resolve_local(&mut self, aid: ActorId) -> Option<ActorRef>;

    /// Resolve a named actor (named-receiver dispatch).
    fn resolve_named(&mut self, name: Atom) -> Option<ActorRef>;

    /// Get or create the proxy for a remote actor; true = created.
    fn proxy(&mut self, node: NodeId, aid: ActorId) -> Option<(ActorRef, bool)>;

    /// The remote actor terminated; kill its local proxy.
    fn kill_proxy(&mut self, node: NodeId, aid: ActorId, reason: ExitReason);

    /// A peer announced a proxy for the local actor `aid`.
    fn add_watcher(&mut self, aid: ActorId, watcher: NodeId);

    /// A direct path to `node` was just established.
    fn learned_new_node_directly(&mut self, node: NodeId);

    /// `node` became reachable through `hop` only.
    fn learned_new_node_indirectly(&mut self, node: NodeId, hop: NodeId);

    /// Connector-side handshake completed; `published` is the actor
    /// published at the remote port, if any.
    fn connection_established(
        &mut self,
        node: NodeId,
        endpoint: EndpointHandle,
        published: Option<ActorId>,
    );

    /// The endpoint violated the protocol; the owner should close its
    /// transport.
    fn endpoint_failed(&mut self, endpoint: EndpointHandle, err: Error);
}

// ---------------------------------------------------------------------------
// Per-endpoint state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    /// Waiting for the peer's handshake.
    HandshakePending,
    Ready,
    Closed,
}

struct EndpointState {
    phase: Phase,
    /// True when this side opened the connection (expects a
    /// server-handshake).
    is_connector: bool,
    /// Actor published at the doorman this connection arrived through
    /// (acceptor side only); announced in the server-handshake.
    published: Option<ActorId>,
    /// Stream reassembly buffer.
    buf: Vec<u8>,
}

impl EndpointState {
    fn accepted(published: Option<ActorId>) -> EndpointState {
        EndpointState {
            phase: Phase::HandshakePending,
            is_connector: false,
            published,
            buf: Vec::new(),
        }
    }

    fn connecting() -> EndpointState {
        EndpointState {
            phase: Phase::HandshakePending,
            is_connector: true,
            published: None,
            buf: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Protocol state for one node: routing table, per-endpoint read
/// state, datagram sequencing.
pub struct Instance {
    this_node: NodeId,
    routing: RoutingTable,
    endpoints: FxHashMap<EndpointHandle, EndpointState>,
    out_seq: FxHashMap<DatagramHandle, SequenceCounter>,
    in_seq: FxHashMap<DatagramHandle, OrderedDelivery>,
    window: u16,
    deliver_unordered: bool,
}

impl Instance {
    pub fn new(this_node: NodeId, window: u16, deliver_unordered: bool) -> Instance {
        Instance {
            this_node,
            routing: RoutingTable::new(),
            endpoints: FxHashMap::default(),
            out_seq: FxHashMap::default(),
            in_seq: FxHashMap::default(),
            window,
            deliver_unordered,
        }
    }

    pub fn this_node(&self) -> NodeId {
        self.this_node
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Register an accepted connection; the peer speaks first with a
    /// client-handshake. Idempotent: an endpoint already known (e.g.
    /// the connector side of a datagram pairing) keeps its state.
    pub fn add_accepted(&mut self, endpoint: EndpointHandle, published: Option<ActorId>) {
        self.endpoints
            .entry(endpoint)
            .or_insert_with(|| EndpointState::accepted(published));
    }

    /// Open the connector side: send the client-handshake and await
    /// the server's reply.
    pub fn start_connection(&mut self, callee: &mut dyn InstanceCallee, endpoint: EndpointHandle) {
        self.endpoints.insert(endpoint, EndpointState::connecting());
        let header = Header::client_handshake(self.this_node);
        self.write_frame(callee, endpoint, header, Vec::new());
    }

    /// Whether the endpoint finished its handshake.
    pub fn is_ready(&self, endpoint: EndpointHandle) -> bool {
        self.endpoints
            .get(&endpoint)
            .map(|s| s.phase == Phase::Ready)
            .unwrap_or(false)
    }

    // -- inbound -----------------------------------------------------------

    /// Feed stream bytes into the reassembly buffer and process every
    /// complete frame.
    pub fn handle_stream_data(
        &mut self,
        callee: &mut dyn InstanceCallee,
        endpoint: EndpointHandle,
        bytes: &[u8],
    ) {
        let frames = {
            let Some(state) = self.endpoints.get_mut(&endpoint) else {
                tracing::warn!(?endpoint, "data on unknown endpoint");
                return;
            };
            if state.phase == Phase::Closed {
                return;
            }
            state.buf.extend_from_slice(bytes);
            let mut frames = Vec::new();
            loop {
                if state.buf.len() < HEADER_SIZE {
                    break;
                }
                let header = match Header::read_from(&state.buf) {
                    Ok(header) => header,
                    Err(err) => {
                        state.phase = Phase::Closed;
                        callee.endpoint_failed(endpoint, err);
                        return;
                    }
                };
                if let Err(err) = header.validate() {
                    state.phase = Phase::Closed;
                    callee.endpoint_failed(endpoint, err);
                    return;
                }
                let total = HEADER_SIZE + header.payload_len as usize;
                if state.buf.len() < total {
                    break;
                }
                let payload = state.buf[HEADER_SIZE..total].to_vec();
                state.buf.drain(..total);
                frames.push((header, payload));
            }
            frames
        };
        for (header, payload) in frames {
            self.handle_frame(callee, endpoint, header, payload);
        }
    }

    /// Process one datagram: strip the sequence number, reorder,
    /// process released frames.
    pub fn handle_datagram(
        &mut self,
        callee: &mut dyn InstanceCallee,
        hdl: DatagramHandle,
        bytes: &[u8],
    ) {
        let endpoint = EndpointHandle::Datagram(hdl);
        if !self.endpoints.contains_key(&endpoint) {
            // First contact on a bound datagram endpoint acts like an
            // accepted connection.
            self.endpoints
                .insert(endpoint, EndpointState::accepted(None));
        }
        if bytes.len() < DATAGRAM_HEADER_SIZE {
            callee.endpoint_failed(endpoint, Error::sec(SecCode::UnexpectedEof));
            return;
        }
        let sequence = match Header::read_from_datagram(bytes) {
            Ok((_, sequence)) => sequence,
            Err(err) => {
                callee.endpoint_failed(endpoint, err);
                return;
            }
        };
        let ordered = self
            .in_seq
            .entry(hdl)
            .or_insert_with(|| OrderedDelivery::new(self.window, self.deliver_unordered));
        match ordered.arrived(sequence, bytes.to_vec()) {
            Arrival::Deliver(frames) => {
                for (_, frame) in frames {
                    self.handle_datagram_frame(callee, endpoint, &frame);
                }
            }
            Arrival::Buffered | Arrival::Dropped => {}
        }
    }

    /// Pending-delivery timeout: release buffered datagrams past any
    /// gaps.
    pub fn flush_pending(&mut self, callee: &mut dyn InstanceCallee, hdl: DatagramHandle) {
        let frames = match self.in_seq.get_mut(&hdl) {
            Some(ordered) => ordered.flush(),
            None => return,
        };
        let endpoint = EndpointHandle::Datagram(hdl);
        for (_, frame) in frames {
            self.handle_datagram_frame(callee, endpoint, &frame);
        }
    }

    pub fn has_pending_datagrams(&self, hdl: DatagramHandle) -> bool {
        self.in_seq
            .get(&hdl)
            .map(|o| o.has_pending())
            .unwrap_or(false)
    }

    fn handle_datagram_frame(
        &mut self,
        callee: &mut dyn InstanceCallee,
        endpoint: EndpointHandle,
        frame: &[u8],
    ) {
        let (header, _) = match Header::read_from_datagram(frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                callee.endpoint_failed(endpoint, err);
                return;
            }
        };
        if let Err(err) = header.validate() {
            callee.endpoint_failed(endpoint, err);
            return;
        }
        let payload = frame[DATAGRAM_HEADER_SIZE..].to_vec();
        if payload.len() != header.payload_len as usize {
            callee.endpoint_failed(endpoint, Error::sec(SecCode::MalformedBaspMessage));
            return;
        }
        self.handle_frame(callee, endpoint, header, payload);
    }

    // -- frame handling ----------------------------------------------------

    fn handle_frame(
        &mut self,
        callee: &mut dyn InstanceCallee,
        endpoint: EndpointHandle,
        header: Header,
        payload: Vec<u8>,
    ) {
        tracing::trace!(?endpoint, op = ?header.operation, "handling frame");
        match header.operation {
            Operation::ClientHandshake => {
                self.handle_client_handshake(callee, endpoint, header)
            }
            Operation::ServerHandshake => {
                self.handle_server_handshake(callee, endpoint, header, payload)
            }
            Operation::DispatchMessage => {
                self.handle_dispatch(callee, endpoint, header, payload)
            }
            // Post-handshake operations addressed to another node
            // relay unchanged, like dispatches.
            _ if !header.dest_node.is_zero() && header.dest_node != self.this_node => {
                self.forward_frame(callee, header, payload);
            }
            Operation::AnnounceProxy => {
                callee.add_watcher(header.dest_actor, header.source_node);
            }
            Operation::KillProxy => {
                let reason = parse_exit_reason(&payload)
                    .unwrap_or(ExitReason::RemoteLinkUnreachable);
                callee.kill_proxy(header.source_node, header.source_actor, reason);
            }
            Operation::Heartbeat => {
                tracing::trace!(node = %header.source_node, "heartbeat");
            }
        }
    }

    /// Relay a non-dispatch frame toward its destination node; dropped
    /// silently when no route exists.
    fn forward_frame(&mut self, callee: &mut dyn InstanceCallee, header: Header, payload: Vec<u8>) {
        match self.routing.lookup(header.dest_node) {
            Some(route) => self.write_frame(callee, route.endpoint(), header, payload),
            None => {
                tracing::debug!(dest = %header.dest_node, op = ?header.operation, "no relay route")
            }
        }
    }

    fn handle_client_handshake(
        &mut self,
        callee: &mut dyn InstanceCallee,
        endpoint: EndpointHandle,
        header: Header,
    ) {
        if header.operation_data != VERSION {
            self.fail_endpoint(callee, endpoint, Error::sec(SecCode::MalformedBaspMessage));
            return;
        }
        if header.source_node == self.this_node {
            // The peer claims our own node id.
            self.fail_endpoint(callee, endpoint, Error::sec(SecCode::CannotConnectToNode));
            return;
        }
        if !self.routing.add_direct(header.source_node, endpoint) {
            tracing::debug!(node = %header.source_node, "redundant connection dropped");
            self.fail_endpoint(callee, endpoint, Error::none());
            return;
        }
        let published = match self.endpoints.get_mut(&endpoint) {
            Some(state) => {
                state.phase = Phase::Ready;
                state.published
            }
            None => None,
        };
        let mut reply = Header::server_handshake(self.this_node, header.source_node);
        let mut payload = Vec::new();
        if let Some(aid) = published {
            payload.extend_from_slice(&aid.to_be_bytes());
        }
        reply.payload_len = payload.len() as u32;
        self.write_frame(callee, endpoint, reply, payload);
        callee.learned_new_node_directly(header.source_node);
    }

    fn handle_server_handshake(
        &mut self,
        callee: &mut dyn InstanceCallee,
        endpoint: EndpointHandle,
        header: Header,
        payload: Vec<u8>,
    ) {
        let is_connector = self
            .endpoints
            .get(&endpoint)
            .map(|s| s.is_connector)
            .unwrap_or(false);
        if !is_connector {
            self.fail_endpoint(callee, endpoint, Error::sec(SecCode::UnexpectedMessage));
            return;
        }
        if header.operation_data != VERSION {
            self.fail_endpoint(callee, endpoint, Error::sec(SecCode::MalformedBaspMessage));
            return;
        }
        if header.source_node == self.this_node {
            self.fail_endpoint(callee, endpoint, Error::sec(SecCode::CannotConnectToNode));
            return;
        }
        self.routing.add_direct(header.source_node, endpoint);
        if let Some(state) = self.endpoints.get_mut(&endpoint) {
            state.phase = Phase::Ready;
        }
        let published = if payload.len() >= 8 {
            let aid = u64::from_be_bytes(payload[0..8].try_into().expect("sized"));
            (aid != 0).then_some(aid)
        } else {
            None
        };
        callee.learned_new_node_directly(header.source_node);
        callee.connection_established(header.source_node, endpoint, published);
    }

    fn handle_dispatch(
        &mut self,
        callee: &mut dyn InstanceCallee,
        endpoint: EndpointHandle,
        header: Header,
        payload: Vec<u8>,
    ) {
        // Learn unknown source nodes as indirect neighbors of the
        // endpoint's peer.
        if !self.routing.reachable(header.source_node) {
            if let Some(hop) = self.routing.lookup_endpoint(endpoint) {
                if header.source_node != self.this_node && hop != header.source_node {
                    self.routing.add_indirect(header.source_node, hop);
                    callee.learned_new_node_indirectly(header.source_node, hop);
                }
            }
        }

        if header.dest_node != self.this_node {
            self.forward_dispatch(callee, header, payload);
            return;
        }

        let mid = MessageId::from_raw(header.operation_data);
        let mut source = BinaryDeserializer::new(&payload);
        let (stage_addrs, content) = match parse_dispatch_payload(&mut source, callee.system()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.fail_endpoint(callee, endpoint, err);
                return;
            }
        };

        let dest = if header.flags & flags::NAMED_RECEIVER != 0 {
            match Atom::from_u64(header.dest_actor) {
                Ok(name) => callee.resolve_named(name),
                Err(_) => {
                    self.fail_endpoint(
                        callee,
                        endpoint,
                        Error::sec(SecCode::MalformedBaspMessage),
                    );
                    return;
                }
            }
        } else {
            callee.resolve_local(header.dest_actor)
        };
        let Some(dest) = dest else {
            tracing::debug!(
                aid = header.dest_actor,
                "dispatch to unknown actor; reporting it down"
            );
            // Tell the sender's node the destination is gone so its
            // proxy (and any pending requests) resolve.
            self.send_kill_proxy(
                callee,
                header.source_node,
                header.dest_actor,
                ExitReason::Normal,
            );
            return;
        };

        let sender = self.proxy_for(callee, header.source_node, header.source_actor);
        let mut stages = Vec::with_capacity(stage_addrs.len());
        for (node, aid) in stage_addrs {
            let stage = if node == self.this_node {
                callee.resolve_local(aid)
            } else {
                self.proxy_for(callee, node, aid)
            };
            if let Some(stage) = stage {
                stages.push(stage);
            }
        }
        callee.deliver(dest, sender, mid, stages, content);
    }

    /// Relay a dispatch frame toward its destination node, unchanged.
    fn forward_dispatch(
        &mut self,
        callee: &mut dyn InstanceCallee,
        header: Header,
        payload: Vec<u8>,
    ) {
        match self.routing.lookup(header.dest_node) {
            Some(route) => {
                tracing::trace!(dest = %header.dest_node, "relaying dispatch");
                self.write_frame(callee, route.endpoint(), header, payload);
            }
            None => {
                tracing::debug!(dest = %header.dest_node, "no route for relayed dispatch");
                // Report the unreachable destination to the sender.
                self.send_kill_proxy(
                    callee,
                    header.source_node,
                    header.dest_actor,
                    ExitReason::RemoteLinkUnreachable,
                );
            }
        }
    }

    /// Get or create a proxy for a remote actor, announcing it on
    /// first creation. Exposed for the broker's connect and lookup
    /// paths.
    pub fn get_proxy(
        &mut self,
        callee: &mut dyn InstanceCallee,
        node: NodeId,
        aid: ActorId,
    ) -> Option<ActorRef> {
        self.proxy_for(callee, node, aid)
    }

    /// Get or create a proxy and announce it on first creation.
    fn proxy_for(
        &mut self,
        callee: &mut dyn InstanceCallee,
        node: NodeId,
        aid: ActorId,
    ) -> Option<ActorRef> {
        if node == self.this_node || aid == 0 {
            return None;
        }
        let (proxy, created) = callee.proxy(node, aid)?;
        if created {
            let mut announce = Header::new(Operation::AnnounceProxy);
            announce.source_node = self.this_node;
            announce.dest_node = node;
            announce.dest_actor = aid;
            if let Some(route) = self.routing.lookup(node) {
                self.write_frame(callee, route.endpoint(), announce, Vec::new());
            }
        }
        Some(proxy)
    }

    // -- outbound ----------------------------------------------------------

    /// Send a user message to a remote actor (or relay toward it).
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &mut self,
        callee: &mut dyn InstanceCallee,
        source: Option<(NodeId, ActorId)>,
        dest_node: NodeId,
        dest_actor: ActorId,
        header_flags: u8,
        mid_raw: u64,
        stages: &[(NodeId, ActorId)],
        content: &Message,
    ) -> Result<(), Error> {
        let route = self
            .routing
            .lookup(dest_node)
            .ok_or(Error::sec(SecCode::NoRouteToNode))?;
        let payload = serialize_dispatch_payload(stages, content)?;
        let (source_node, source_actor) = source.unwrap_or((self.this_node, 0));
        let header = Header {
            operation: Operation::DispatchMessage,
            flags: header_flags,
            payload_len: payload.len() as u32,
            operation_data: mid_raw,
            source_node,
            dest_node,
            source_actor,
            dest_actor,
        };
        if let Route::Indirect { hop, .. } = route {
            tracing::trace!(dest = %dest_node, via = %hop, "dispatching via relay");
        }
        self.write_frame(callee, route.endpoint(), header, payload);
        Ok(())
    }

    /// Notify `watcher_node` that local actor `aid` terminated.
    pub fn send_kill_proxy(
        &mut self,
        callee: &mut dyn InstanceCallee,
        watcher_node: NodeId,
        aid: ActorId,
        reason: ExitReason,
    ) {
        let Some(route) = self.routing.lookup(watcher_node) else {
            tracing::debug!(node = %watcher_node, "no route for kill-proxy");
            return;
        };
        let mut header = Header::new(Operation::KillProxy);
        header.source_node = self.this_node;
        header.dest_node = watcher_node;
        header.source_actor = aid;
        let payload = reason.code().to_be_bytes().to_vec();
        header.payload_len = payload.len() as u32;
        self.write_frame(callee, route.endpoint(), header, payload);
    }

    /// Probe every direct neighbor.
    pub fn send_heartbeats(&mut self, callee: &mut dyn InstanceCallee) {
        for (node, endpoint) in self.routing.direct_nodes() {
            let header = Header::heartbeat(self.this_node, node);
            self.write_frame(callee, endpoint, header, Vec::new());
        }
    }

    // -- endpoint lifecycle ------------------------------------------------

    /// The transport reported closure: drop routes and report what was
    /// lost. The caller kills proxies for the returned nodes.
    pub fn endpoint_closed(&mut self, endpoint: EndpointHandle) -> ErasedRoutes {
        self.endpoints.remove(&endpoint);
        if let EndpointHandle::Datagram(hdl) = endpoint {
            self.out_seq.remove(&hdl);
            self.in_seq.remove(&hdl);
        }
        self.routing.erase_endpoint(endpoint)
    }

    fn fail_endpoint(
        &mut self,
        callee: &mut dyn InstanceCallee,
        endpoint: EndpointHandle,
        err: Error,
    ) {
        if let Some(state) = self.endpoints.get_mut(&endpoint) {
            state.phase = Phase::Closed;
        }
        callee.endpoint_failed(endpoint, err);
    }

    /// Write one frame, appending the sequence number on datagram
    /// paths.
    fn write_frame(
        &mut self,
        callee: &mut dyn InstanceCallee,
        endpoint: EndpointHandle,
        header: Header,
        payload: Vec<u8>,
    ) {
        let mut bytes = Vec::with_capacity(DATAGRAM_HEADER_SIZE + payload.len());
        match endpoint {
            EndpointHandle::Stream(_) => header.write_to(&mut bytes),
            EndpointHandle::Datagram(hdl) => {
                let seq = self.out_seq.entry(hdl).or_default().next();
                header.write_to_datagram(seq, &mut bytes);
            }
        }
        bytes.extend_from_slice(&payload);
        callee.write(endpoint, bytes);
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("node", &self.this_node)
            .field("endpoints", &self.endpoints.len())
            .field("routing", &self.routing)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Dispatch payload: varint stage count, per stage a raw node id plus
/// `u64` actor id, then the serialized message.
pub fn serialize_dispatch_payload(
    stages: &[(NodeId, ActorId)],
    content: &Message,
) -> Result<Vec<u8>, Error> {
    let mut sink = BinarySerializer::new();
    sink.begin_sequence(stages.len())?;
    for (node, aid) in stages {
        let mut raw = Vec::with_capacity(NodeId::WIRE_SIZE);
        node.write_to(&mut raw);
        sink.write_raw(&raw)?;
        sink.write_u64(*aid)?;
    }
    sink.end_sequence()?;
    content.serialize(&mut sink)?;
    Ok(sink.into_bytes())
}

fn parse_dispatch_payload(
    source: &mut BinaryDeserializer<'_>,
    system: &ActorSystem,
) -> Result<(Vec<(NodeId, ActorId)>, Message), Error> {
    let count = source.begin_sequence()?;
    let mut stages = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = source.read_raw(NodeId::WIRE_SIZE)?;
        let (node, _) = NodeId::read_from(&raw).ok_or(Error::sec(SecCode::UnexpectedEof))?;
        let aid = source.read_u64()?;
        stages.push((node, aid));
    }
    source.end_sequence()?;
    let content = Message::deserialize(source, system.types())?;
    Ok((stages, content))
}

fn parse_exit_reason(payload: &[u8]) -> Option<ExitReason> {
    if payload.len() < 4 {
        return None;
    }
    let code = u32::from_be_bytes(payload[0..4].try_into().ok()?);
    ExitReason::from_code(code)
}
