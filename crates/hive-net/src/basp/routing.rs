//! The BASP routing table.
//!
//! Maps node ids to paths: *direct* (a transport endpoint on this
//! node) or *indirect* (a neighbor that can relay). A node is
//! reachable iff it has a direct path or its relay does. Direct paths
//! win; adding one retires any indirect entry for the same node.

use hive_core::NodeId;
use rustc_hash::FxHashMap;

use crate::mpx::{ConnectionHandle, DatagramHandle};

/// Transport-agnostic endpoint identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EndpointHandle {
    Stream(ConnectionHandle),
    Datagram(DatagramHandle),
}

impl EndpointHandle {
    pub fn is_datagram(self) -> bool {
        matches!(self, EndpointHandle::Datagram(_))
    }
}

/// A resolved path to some node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Route {
    /// Write to this endpoint.
    Direct(EndpointHandle),
    /// Relay through `hop`, reachable at `endpoint`.
    Indirect {
        hop: NodeId,
        endpoint: EndpointHandle,
    },
}

impl Route {
    pub fn endpoint(self) -> EndpointHandle {
        match self {
            Route::Direct(endpoint) => endpoint,
            Route::Indirect { endpoint, .. } => endpoint,
        }
    }
}

/// Everything erased by one endpoint closure.
#[derive(Debug, Default, PartialEq)]
pub struct ErasedRoutes {
    /// The node that lost its direct path, if the endpoint carried
    /// one.
    pub direct: Option<NodeId>,
    /// Nodes whose indirect entries relayed through the lost node.
    pub indirect: Vec<NodeId>,
}

/// Bidirectional node/path mapping plus the indirect relay map.
#[derive(Default)]
pub struct RoutingTable {
    direct: FxHashMap<NodeId, EndpointHandle>,
    by_endpoint: FxHashMap<EndpointHandle, NodeId>,
    indirect: FxHashMap<NodeId, NodeId>,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable::default()
    }

    /// Bind `node` to a direct endpoint. Keeps an existing binding (at
    /// most one direct path per node); returns whether the new one was
    /// stored. Retires any indirect entry for `node`.
    pub fn add_direct(&mut self, node: NodeId, endpoint: EndpointHandle) -> bool {
        if self.direct.contains_key(&node) {
            return false;
        }
        self.direct.insert(node, endpoint);
        self.by_endpoint.insert(endpoint, node);
        self.indirect.remove(&node);
        true
    }

    /// Record that `hop` can relay to `node`. No-op when a direct path
    /// exists or the entry is already present.
    pub fn add_indirect(&mut self, node: NodeId, hop: NodeId) -> bool {
        if self.direct.contains_key(&node) || self.indirect.contains_key(&node) {
            return false;
        }
        self.indirect.insert(node, hop);
        true
    }

    /// Resolve a path to `node`.
    pub fn lookup(&self, node: NodeId) -> Option<Route> {
        if let Some(&endpoint) = self.direct.get(&node) {
            return Some(Route::Direct(endpoint));
        }
        let &hop = self.indirect.get(&node)?;
        let &endpoint = self.direct.get(&hop)?;
        Some(Route::Indirect { hop, endpoint })
    }

    /// The node bound to an endpoint, if the handshake completed.
    pub fn lookup_endpoint(&self, endpoint: EndpointHandle) -> Option<NodeId> {
        self.by_endpoint.get(&endpoint).copied()
    }

    /// Whether `node` has a direct path.
    pub fn is_direct(&self, node: NodeId) -> bool {
        self.direct.contains_key(&node)
    }

    pub fn reachable(&self, node: NodeId) -> bool {
        self.lookup(node).is_some()
    }

    /// Drop everything attached to a closed endpoint: the direct
    /// binding and all indirect entries relaying through the lost
    /// node.
    pub fn erase_endpoint(&mut self, endpoint: EndpointHandle) -> ErasedRoutes {
        let mut erased = ErasedRoutes::default();
        if let Some(node) = self.by_endpoint.remove(&endpoint) {
            self.direct.remove(&node);
            erased.direct = Some(node);
            let orphaned: Vec<NodeId> = self
                .indirect
                .iter()
                .filter(|(_, hop)| **hop == node)
                .map(|(n, _)| *n)
                .collect();
            for n in &orphaned {
                self.indirect.remove(n);
            }
            erased.indirect = orphaned;
        }
        erased
    }

    /// All nodes with a direct path, e.g. for heartbeat fan-out.
    pub fn direct_nodes(&self) -> Vec<(NodeId, EndpointHandle)> {
        self.direct.iter().map(|(n, e)| (*n, *e)).collect()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("direct", &self.direct.len())
            .field("indirect", &self.indirect.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
