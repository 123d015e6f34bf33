//! Deterministic in-process multiplexer for tests.
//!
//! A [`TestNetwork`] is a virtual wire shared by any number of
//! [`TestMultiplexer`]s (typically one per actor system under test).
//! Hosts are plain labels; connecting pairs endpoints directly and
//! every write turns into an event message in the peer owner's
//! mailbox. Nothing runs until the test drives the systems' schedulers,
//! so delivery interleavings are fully reproducible.
//!
//! Credit is honored faithfully: a passive endpoint buffers writes
//! until its owner grants more.

use std::collections::VecDeque;
use std::sync::Arc;

use hive_core::{ActorRef, Error, SecCode};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::broker::{
    ConnectionClosedMsg, DataTransferredMsg, DatagramClosedMsg, DatagramSentMsg,
    NewConnectionMsg, NewDataMsg, NewDatagramMsg,
};
use crate::mpx::{
    AcceptorHandle, ConnectionHandle, DatagramHandle, Multiplexer, UNLIMITED_CREDIT,
};

// ---------------------------------------------------------------------------
// Network state
// ---------------------------------------------------------------------------

struct DoormanEntry {
    hdl: AcceptorHandle,
    owner: ActorRef,
}

struct UdpBind {
    hdl: DatagramHandle,
    owner: ActorRef,
}

struct StreamEnd {
    peer: Option<ConnectionHandle>,
    owner: ActorRef,
    credit: usize,
    queued: VecDeque<Vec<u8>>,
}

struct DatagramEnd {
    peer: Option<DatagramHandle>,
    /// The bound endpoint this end descends from (itself for
    /// remote-created ends).
    parent: DatagramHandle,
    owner: ActorRef,
    credit: usize,
    queued: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct NetCore {
    next_id: u64,
    next_port: u16,
    doormen: FxHashMap<(String, u16), DoormanEntry>,
    udp_binds: FxHashMap<(String, u16), UdpBind>,
    streams: FxHashMap<ConnectionHandle, StreamEnd>,
    datagrams: FxHashMap<DatagramHandle, DatagramEnd>,
}

impl NetCore {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn alloc_port(&mut self, requested: u16) -> u16 {
        if requested != 0 {
            return requested;
        }
        self.next_port += 1;
        1024 + self.next_port
    }
}

/// The shared virtual wire.
pub struct TestNetwork {
    inner: Mutex<NetCore>,
}

impl TestNetwork {
    pub fn new() -> Arc<TestNetwork> {
        Arc::new(TestNetwork {
            inner: Mutex::new(NetCore::default()),
        })
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        TestNetwork {
            inner: Mutex::new(NetCore::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// TestMultiplexer
// ---------------------------------------------------------------------------

/// One system's view of the virtual network, addressable as `host`.
pub struct TestMultiplexer {
    network: Arc<TestNetwork>,
    host: String,
}

impl TestMultiplexer {
    pub fn new(network: Arc<TestNetwork>, host: &str) -> Arc<TestMultiplexer> {
        Arc::new(TestMultiplexer {
            network,
            host: host.to_string(),
        })
    }
}

impl Multiplexer for TestMultiplexer {
    fn new_tcp_scribe(
        &self,
        host: &str,
        port: u16,
        owner: &ActorRef,
    ) -> Result<ConnectionHandle, Error> {
        let mut net = self.network.inner.lock();
        let (acceptor_hdl, acceptor_owner) = match net.doormen.get(&(host.to_string(), port)) {
            Some(doorman) => (doorman.hdl, doorman.owner.clone()),
            None => return Err(Error::sec(SecCode::CannotConnectToNode)),
        };
        let a = ConnectionHandle(net.next_id());
        let b = ConnectionHandle(net.next_id());
        net.streams.insert(
            a,
            StreamEnd {
                peer: Some(b),
                owner: owner.clone(),
                credit: UNLIMITED_CREDIT,
                queued: VecDeque::new(),
            },
        );
        net.streams.insert(
            b,
            StreamEnd {
                peer: Some(a),
                owner: acceptor_owner.clone(),
                credit: UNLIMITED_CREDIT,
                queued: VecDeque::new(),
            },
        );
        drop(net);
        acceptor_owner.send((NewConnectionMsg {
            source: acceptor_hdl,
            handle: b,
        },));
        Ok(a)
    }

    fn new_tcp_doorman(
        &self,
        port: u16,
        _reuse_addr: bool,
        owner: &ActorRef,
    ) -> Result<(AcceptorHandle, u16), Error> {
        let mut net = self.network.inner.lock();
        let bound = net.alloc_port(port);
        let key = (self.host.clone(), bound);
        if net.doormen.contains_key(&key) {
            return Err(Error::sec(SecCode::CannotOpenPort));
        }
        let hdl = AcceptorHandle(net.next_id());
        net.doormen.insert(
            key,
            DoormanEntry {
                hdl,
                owner: owner.clone(),
            },
        );
        Ok((hdl, bound))
    }

    fn new_udp_endpoint_local(
        &self,
        port: u16,
        owner: &ActorRef,
    ) -> Result<(DatagramHandle, u16), Error> {
        let mut net = self.network.inner.lock();
        let bound = net.alloc_port(port);
        let key = (self.host.clone(), bound);
        if net.udp_binds.contains_key(&key) {
            return Err(Error::sec(SecCode::CannotOpenPort));
        }
        let hdl = DatagramHandle(net.next_id());
        net.udp_binds.insert(
            key,
            UdpBind {
                hdl,
                owner: owner.clone(),
            },
        );
        Ok((hdl, bound))
    }

    fn new_udp_endpoint_remote(
        &self,
        host: &str,
        port: u16,
        owner: &ActorRef,
    ) -> Result<DatagramHandle, Error> {
        let mut net = self.network.inner.lock();
        let (bind_hdl, bind_owner) = match net.udp_binds.get(&(host.to_string(), port)) {
            Some(bind) => (bind.hdl, bind.owner.clone()),
            None => return Err(Error::sec(SecCode::CannotConnectToNode)),
        };
        let remote = DatagramHandle(net.next_id());
        let child = DatagramHandle(net.next_id());
        net.datagrams.insert(
            remote,
            DatagramEnd {
                peer: Some(child),
                parent: remote,
                owner: owner.clone(),
                credit: UNLIMITED_CREDIT,
                queued: VecDeque::new(),
            },
        );
        net.datagrams.insert(
            child,
            DatagramEnd {
                peer: Some(remote),
                parent: bind_hdl,
                owner: bind_owner,
                credit: UNLIMITED_CREDIT,
                queued: VecDeque::new(),
            },
        );
        Ok(remote)
    }

    fn write(&self, hdl: ConnectionHandle, buf: Vec<u8>) -> Result<(), Error> {
        let written = buf.len() as u64;
        let (writer_owner, delivery) = {
            let mut net = self.network.inner.lock();
            let Some(end) = net.streams.get(&hdl) else {
                return Err(Error::sec(SecCode::InvalidStreamState));
            };
            let writer_owner = end.owner.clone();
            let Some(peer_hdl) = end.peer else {
                return Err(Error::sec(SecCode::InvalidStreamState));
            };
            let Some(peer) = net.streams.get_mut(&peer_hdl) else {
                return Err(Error::sec(SecCode::InvalidStreamState));
            };
            if peer.credit == 0 {
                peer.queued.push_back(buf);
                (writer_owner, None)
            } else {
                if peer.credit != UNLIMITED_CREDIT {
                    peer.credit -= 1;
                }
                (writer_owner, Some((peer.owner.clone(), peer_hdl, buf)))
            }
        };
        if let Some((owner, peer_hdl, buf)) = delivery {
            owner.send((NewDataMsg {
                handle: peer_hdl,
                buf: buf.into(),
            },));
        }
        writer_owner.send((DataTransferredMsg {
            handle: hdl,
            written,
        },));
        Ok(())
    }

    fn write_datagram(&self, hdl: DatagramHandle, buf: Vec<u8>) -> Result<(), Error> {
        let written = buf.len() as u64;
        let (writer_owner, delivery) = {
            let mut net = self.network.inner.lock();
            let Some(end) = net.datagrams.get(&hdl) else {
                return Err(Error::sec(SecCode::InvalidStreamState));
            };
            let writer_owner = end.owner.clone();
            let Some(peer_hdl) = end.peer else {
                return Err(Error::sec(SecCode::InvalidStreamState));
            };
            let Some(peer) = net.datagrams.get_mut(&peer_hdl) else {
                return Err(Error::sec(SecCode::InvalidStreamState));
            };
            let parent = peer.parent;
            if peer.credit == 0 {
                peer.queued.push_back(buf);
                (writer_owner, None)
            } else {
                if peer.credit != UNLIMITED_CREDIT {
                    peer.credit -= 1;
                }
                (writer_owner, Some((peer.owner.clone(), parent, peer_hdl, buf)))
            }
        };
        if let Some((owner, parent, peer_hdl, buf)) = delivery {
            owner.send((NewDatagramMsg {
                source: parent,
                handle: peer_hdl,
                buf: buf.into(),
            },));
        }
        writer_owner.send((DatagramSentMsg {
            handle: hdl,
            written,
        },));
        Ok(())
    }

    fn trigger(&self, hdl: ConnectionHandle, credit: usize) {
        let deliveries = {
            let mut net = self.network.inner.lock();
            let Some(end) = net.streams.get_mut(&hdl) else {
                return;
            };
            // The first trigger switches the endpoint from unlimited to
            // credit-gated mode.
            end.credit = if end.credit == UNLIMITED_CREDIT {
                credit
            } else {
                end.credit.saturating_add(credit)
            };
            let mut out = Vec::new();
            while end.credit > 0 {
                let Some(buf) = end.queued.pop_front() else {
                    break;
                };
                if end.credit != UNLIMITED_CREDIT {
                    end.credit -= 1;
                }
                out.push((end.owner.clone(), buf));
            }
            out
        };
        for (owner, buf) in deliveries {
            owner.send((NewDataMsg {
                handle: hdl,
                buf: buf.into(),
            },));
        }
    }

    fn trigger_datagram(&self, hdl: DatagramHandle, credit: usize) {
        let deliveries = {
            let mut net = self.network.inner.lock();
            let Some(end) = net.datagrams.get_mut(&hdl) else {
                return;
            };
            end.credit = if end.credit == UNLIMITED_CREDIT {
                credit
            } else {
                end.credit.saturating_add(credit)
            };
            let parent = end.parent;
            let mut out = Vec::new();
            while end.credit > 0 {
                let Some(buf) = end.queued.pop_front() else {
                    break;
                };
                if end.credit != UNLIMITED_CREDIT {
                    end.credit -= 1;
                }
                out.push((end.owner.clone(), parent, buf));
            }
            out
        };
        for (owner, parent, buf) in deliveries {
            owner.send((NewDatagramMsg {
                source: parent,
                handle: hdl,
                buf: buf.into(),
            },));
        }
    }

    fn close(&self, hdl: ConnectionHandle) {
        let notify = {
            let mut net = self.network.inner.lock();
            let Some(end) = net.streams.remove(&hdl) else {
                return;
            };
            end.peer.and_then(|peer_hdl| {
                net.streams
                    .remove(&peer_hdl)
                    .map(|peer| (peer.owner, peer_hdl))
            })
        };
        if let Some((owner, peer_hdl)) = notify {
            owner.send((ConnectionClosedMsg { handle: peer_hdl },));
        }
    }

    fn close_acceptor(&self, hdl: AcceptorHandle) {
        let mut net = self.network.inner.lock();
        net.doormen.retain(|_, entry| entry.hdl != hdl);
    }

    fn close_datagram(&self, hdl: DatagramHandle) {
        let notify = {
            let mut net = self.network.inner.lock();
            net.udp_binds.retain(|_, bind| bind.hdl != hdl);
            let Some(end) = net.datagrams.remove(&hdl) else {
                return;
            };
            end.peer.and_then(|peer_hdl| {
                net.datagrams
                    .remove(&peer_hdl)
                    .map(|peer| (peer.owner, peer_hdl))
            })
        };
        if let Some((owner, peer_hdl)) = notify {
            owner.send((DatagramClosedMsg { handle: peer_hdl },));
        }
    }

    fn local_host(&self) -> String {
        self.host.clone()
    }
}

impl std::fmt::Debug for TestMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestMultiplexer")
            .field("host", &self.host)
            .finish()
    }
}
