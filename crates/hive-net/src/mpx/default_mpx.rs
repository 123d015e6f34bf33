//! Thread-driven socket multiplexer.
//!
//! One accept thread per doorman, one reader and one writer thread per
//! stream connection, one reader thread per datagram socket. Transport
//! activity turns into event messages in the owning broker's mailbox;
//! writes go through a channel so broker handlers never block on the
//! network.
//!
//! Read credit gates the reader threads: a passive endpoint's reader
//! parks until the broker grants more credit.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use hive_core::{ActorRef, Error, SecCode};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::broker::{
    ConnectionClosedMsg, DataTransferredMsg, DatagramClosedMsg, NewConnectionMsg, NewDataMsg,
    NewDatagramMsg,
};
use crate::mpx::{
    AcceptorHandle, ConnectionHandle, DatagramHandle, Multiplexer, UNLIMITED_CREDIT,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 64 * 1024;
const MAX_DATAGRAM: usize = 64 * 1024;
/// Poll period for shutdown checks on blocking reads.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Credit gate
// ---------------------------------------------------------------------------

/// Counting gate for reader threads; unlimited until the first
/// trigger.
struct CreditGate {
    remaining: Mutex<usize>,
    granted: Condvar,
}

impl CreditGate {
    fn new() -> CreditGate {
        CreditGate {
            remaining: Mutex::new(UNLIMITED_CREDIT),
            granted: Condvar::new(),
        }
    }

    /// Consume one credit, parking while the endpoint is passive.
    /// Returns false when `shutdown` was raised while waiting.
    fn acquire(&self, shutdown: &AtomicBool) -> bool {
        let mut remaining = self.remaining.lock();
        loop {
            if shutdown.load(Ordering::Acquire) {
                return false;
            }
            if *remaining > 0 {
                if *remaining != UNLIMITED_CREDIT {
                    *remaining -= 1;
                }
                return true;
            }
            self.granted.wait_for(&mut remaining, POLL_TIMEOUT);
        }
    }

    /// Return one credit after a read that produced no event (poll
    /// timeout).
    fn refund(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining != UNLIMITED_CREDIT {
            *remaining += 1;
        }
    }

    /// Grant credit; the first grant switches the endpoint from
    /// unlimited to credit-gated mode.
    fn add(&self, credit: usize) {
        let mut remaining = self.remaining.lock();
        *remaining = if *remaining == UNLIMITED_CREDIT {
            credit
        } else {
            remaining.saturating_add(credit)
        };
        drop(remaining);
        self.granted.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Endpoint control blocks
// ---------------------------------------------------------------------------

struct ScribeCtl {
    stream: TcpStream,
    shutdown: AtomicBool,
    credit: CreditGate,
}

/// Map entry: the control block plus the write-queue sender. Removing
/// the entry drops the sender, which ends the writer thread.
struct ScribeEntry {
    ctl: Arc<ScribeCtl>,
    tx: Sender<Vec<u8>>,
}

struct DoormanCtl {
    shutdown: AtomicBool,
    port: u16,
}

struct DatagramCtl {
    socket: UdpSocket,
    /// Fixed peer for remote endpoints and per-peer children; `None`
    /// for bound parents.
    peer: Option<SocketAddr>,
    shutdown: AtomicBool,
    credit: CreditGate,
}

struct Core {
    next_id: AtomicU64,
    scribes: Mutex<FxHashMap<ConnectionHandle, ScribeEntry>>,
    doormen: Mutex<FxHashMap<AcceptorHandle, Arc<DoormanCtl>>>,
    datagrams: Mutex<FxHashMap<DatagramHandle, Arc<DatagramCtl>>>,
}

impl Core {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// DefaultMultiplexer
// ---------------------------------------------------------------------------

/// Socket-backed multiplexer; see the module docs.
pub struct DefaultMultiplexer {
    core: Arc<Core>,
}

impl DefaultMultiplexer {
    pub fn new() -> Arc<DefaultMultiplexer> {
        Arc::new(DefaultMultiplexer {
            core: Arc::new(Core {
                next_id: AtomicU64::new(1),
                scribes: Mutex::new(FxHashMap::default()),
                doormen: Mutex::new(FxHashMap::default()),
                datagrams: Mutex::new(FxHashMap::default()),
            }),
        })
    }

    /// Wrap a connected stream in a scribe with reader and writer
    /// threads. For accepted connections, `announce` names the doorman
    /// whose `NewConnectionMsg` must precede any data event, so the
    /// announcement goes out before the reader thread starts.
    fn add_scribe(
        &self,
        stream: TcpStream,
        owner: &ActorRef,
        announce: Option<AcceptorHandle>,
    ) -> Result<ConnectionHandle, Error> {
        let hdl = ConnectionHandle(self.core.next_id());
        let (tx, rx) = unbounded::<Vec<u8>>();
        let ctl = Arc::new(ScribeCtl {
            stream: stream.try_clone().map_err(io_error)?,
            shutdown: AtomicBool::new(false),
            credit: CreditGate::new(),
        });
        self.core.scribes.lock().insert(
            hdl,
            ScribeEntry {
                ctl: Arc::clone(&ctl),
                tx,
            },
        );
        if let Some(source) = announce {
            owner.send((NewConnectionMsg {
                source,
                handle: hdl,
            },));
        }

        let core = Arc::clone(&self.core);
        let reader_ctl = Arc::clone(&ctl);
        let reader_owner = owner.clone();
        std::thread::Builder::new()
            .name(format!("hive-scribe-{}", hdl))
            .spawn(move || scribe_reader(core, reader_ctl, hdl, reader_owner))
            .map_err(io_error)?;

        let writer_owner = owner.clone();
        std::thread::Builder::new()
            .name(format!("hive-scribe-w-{}", hdl))
            .spawn(move || scribe_writer(ctl, rx, hdl, writer_owner))
            .map_err(io_error)?;
        Ok(hdl)
    }
}

fn io_error(err: std::io::Error) -> Error {
    tracing::debug!(%err, "transport error");
    Error::sec(SecCode::CannotConnectToNode)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    (host, port)
        .to_socket_addrs()
        .map_err(io_error)?
        .next()
        .ok_or(Error::sec(SecCode::CannotConnectToNode))
}

impl Multiplexer for DefaultMultiplexer {
    fn new_tcp_scribe(
        &self,
        host: &str,
        port: u16,
        owner: &ActorRef,
    ) -> Result<ConnectionHandle, Error> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(io_error)?;
        stream.set_nodelay(true).ok();
        self.add_scribe(stream, owner, None)
    }

    fn new_tcp_doorman(
        &self,
        port: u16,
        _reuse_addr: bool,
        owner: &ActorRef,
    ) -> Result<(AcceptorHandle, u16), Error> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|_| Error::sec(SecCode::CannotOpenPort))?;
        let bound = listener
            .local_addr()
            .map_err(|_| Error::sec(SecCode::CannotOpenPort))?
            .port();
        let hdl = AcceptorHandle(self.core.next_id());
        let ctl = Arc::new(DoormanCtl {
            shutdown: AtomicBool::new(false),
            port: bound,
        });
        self.core.doormen.lock().insert(hdl, Arc::clone(&ctl));

        let mpx = DefaultMultiplexer {
            core: Arc::clone(&self.core),
        };
        let owner = owner.clone();
        std::thread::Builder::new()
            .name(format!("hive-doorman-{}", hdl))
            .spawn(move || doorman_loop(mpx, ctl, listener, hdl, owner))
            .map_err(|_| Error::sec(SecCode::CannotOpenPort))?;
        Ok((hdl, bound))
    }

    fn new_udp_endpoint_local(
        &self,
        port: u16,
        owner: &ActorRef,
    ) -> Result<(DatagramHandle, u16), Error> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .map_err(|_| Error::sec(SecCode::CannotOpenPort))?;
        socket
            .set_read_timeout(Some(POLL_TIMEOUT))
            .map_err(io_error)?;
        let bound = socket
            .local_addr()
            .map_err(|_| Error::sec(SecCode::CannotOpenPort))?
            .port();
        let hdl = DatagramHandle(self.core.next_id());
        let ctl = Arc::new(DatagramCtl {
            socket: socket.try_clone().map_err(io_error)?,
            peer: None,
            shutdown: AtomicBool::new(false),
            credit: CreditGate::new(),
        });
        self.core.datagrams.lock().insert(hdl, Arc::clone(&ctl));

        let core = Arc::clone(&self.core);
        let owner = owner.clone();
        std::thread::Builder::new()
            .name(format!("hive-udp-{}", hdl))
            .spawn(move || udp_parent_loop(core, ctl, socket, hdl, owner))
            .map_err(|_| Error::sec(SecCode::CannotOpenPort))?;
        Ok((hdl, bound))
    }

    fn new_udp_endpoint_remote(
        &self,
        host: &str,
        port: u16,
        owner: &ActorRef,
    ) -> Result<DatagramHandle, Error> {
        let peer = resolve(host, port)?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(io_error)?;
        socket
            .set_read_timeout(Some(POLL_TIMEOUT))
            .map_err(io_error)?;
        socket.connect(peer).map_err(io_error)?;
        let hdl = DatagramHandle(self.core.next_id());
        let ctl = Arc::new(DatagramCtl {
            socket: socket.try_clone().map_err(io_error)?,
            peer: Some(peer),
            shutdown: AtomicBool::new(false),
            credit: CreditGate::new(),
        });
        self.core.datagrams.lock().insert(hdl, Arc::clone(&ctl));

        let core = Arc::clone(&self.core);
        let owner = owner.clone();
        std::thread::Builder::new()
            .name(format!("hive-udp-{}", hdl))
            .spawn(move || udp_remote_loop(core, ctl, socket, hdl, owner))
            .map_err(io_error)?;
        Ok(hdl)
    }

    fn write(&self, hdl: ConnectionHandle, buf: Vec<u8>) -> Result<(), Error> {
        let tx = self
            .core
            .scribes
            .lock()
            .get(&hdl)
            .map(|entry| entry.tx.clone())
            .ok_or(Error::sec(SecCode::InvalidStreamState))?;
        tx.send(buf)
            .map_err(|_| Error::sec(SecCode::InvalidStreamState))
    }

    fn write_datagram(&self, hdl: DatagramHandle, buf: Vec<u8>) -> Result<(), Error> {
        let ctl = self
            .core
            .datagrams
            .lock()
            .get(&hdl)
            .cloned()
            .ok_or(Error::sec(SecCode::InvalidStreamState))?;
        let result = match ctl.peer {
            Some(peer) => ctl.socket.send_to(&buf, peer),
            None => Err(std::io::Error::other("datagram endpoint without peer")),
        };
        result.map(|_| ()).map_err(io_error)
    }

    fn trigger(&self, hdl: ConnectionHandle, credit: usize) {
        if let Some(entry) = self.core.scribes.lock().get(&hdl) {
            entry.ctl.credit.add(credit);
        }
    }

    fn trigger_datagram(&self, hdl: DatagramHandle, credit: usize) {
        if let Some(ctl) = self.core.datagrams.lock().get(&hdl) {
            ctl.credit.add(credit);
        }
    }

    fn close(&self, hdl: ConnectionHandle) {
        if let Some(entry) = self.core.scribes.lock().remove(&hdl) {
            entry.ctl.shutdown.store(true, Ordering::Release);
            entry.ctl.stream.shutdown(std::net::Shutdown::Both).ok();
            // Dropping `entry.tx` ends the writer thread.
        }
    }

    fn close_acceptor(&self, hdl: AcceptorHandle) {
        if let Some(ctl) = self.core.doormen.lock().remove(&hdl) {
            ctl.shutdown.store(true, Ordering::Release);
            // Unblock the accept loop.
            let _ = TcpStream::connect(("127.0.0.1", ctl.port));
        }
    }

    fn close_datagram(&self, hdl: DatagramHandle) {
        if let Some(ctl) = self.core.datagrams.lock().remove(&hdl) {
            ctl.shutdown.store(true, Ordering::Release);
        }
    }

    fn local_host(&self) -> String {
        "127.0.0.1".to_string()
    }
}

impl std::fmt::Debug for DefaultMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultMultiplexer")
            .field("scribes", &self.core.scribes.lock().len())
            .field("doormen", &self.core.doormen.lock().len())
            .field("datagrams", &self.core.datagrams.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Endpoint threads
// ---------------------------------------------------------------------------

fn scribe_reader(core: Arc<Core>, ctl: Arc<ScribeCtl>, hdl: ConnectionHandle, owner: ActorRef) {
    let mut stream = match ctl.stream.try_clone() {
        Ok(stream) => stream,
        Err(_) => {
            owner.send((ConnectionClosedMsg { handle: hdl },));
            return;
        }
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if !ctl.credit.acquire(&ctl.shutdown) {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => {
                if !ctl.shutdown.swap(true, Ordering::AcqRel) {
                    owner.send((ConnectionClosedMsg { handle: hdl },));
                }
                break;
            }
            Ok(n) => {
                owner.send((NewDataMsg {
                    handle: hdl,
                    buf: buf[..n].to_vec().into(),
                },));
            }
        }
    }
    // Drop the map entry (and with it the writer's channel).
    core.scribes.lock().remove(&hdl);
}

fn scribe_writer(
    ctl: Arc<ScribeCtl>,
    rx: Receiver<Vec<u8>>,
    hdl: ConnectionHandle,
    owner: ActorRef,
) {
    let mut stream = match ctl.stream.try_clone() {
        Ok(stream) => stream,
        Err(_) => return,
    };
    for buf in rx.iter() {
        if ctl.shutdown.load(Ordering::Acquire) {
            return;
        }
        match stream.write_all(&buf) {
            Ok(()) => {
                owner.send((DataTransferredMsg {
                    handle: hdl,
                    written: buf.len() as u64,
                },));
            }
            Err(_) => {
                if !ctl.shutdown.swap(true, Ordering::AcqRel) {
                    owner.send((ConnectionClosedMsg { handle: hdl },));
                }
                return;
            }
        }
    }
}

fn doorman_loop(
    mpx: DefaultMultiplexer,
    ctl: Arc<DoormanCtl>,
    listener: TcpListener,
    hdl: AcceptorHandle,
    owner: ActorRef,
) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if ctl.shutdown.load(Ordering::Acquire) {
                    return;
                }
                stream.set_nodelay(true).ok();
                if let Err(err) = mpx.add_scribe(stream, &owner, Some(hdl)) {
                    tracing::debug!(%err, "failed to adopt accepted connection");
                }
            }
            Err(err) => {
                if ctl.shutdown.load(Ordering::Acquire) {
                    return;
                }
                tracing::debug!(%err, "accept failed");
            }
        }
    }
}

/// Reader for a bound datagram socket: demultiplexes peers into child
/// endpoints.
fn udp_parent_loop(
    core: Arc<Core>,
    ctl: Arc<DatagramCtl>,
    socket: UdpSocket,
    hdl: DatagramHandle,
    owner: ActorRef,
) {
    let mut children: FxHashMap<SocketAddr, DatagramHandle> = FxHashMap::default();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        if !ctl.credit.acquire(&ctl.shutdown) {
            break;
        }
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                let child = match children.get(&peer) {
                    Some(child) => *child,
                    None => {
                        let Ok(cloned) = ctl.socket.try_clone() else {
                            continue;
                        };
                        let child = DatagramHandle(core.next_id());
                        let child_ctl = Arc::new(DatagramCtl {
                            socket: cloned,
                            peer: Some(peer),
                            shutdown: AtomicBool::new(false),
                            credit: CreditGate::new(),
                        });
                        core.datagrams.lock().insert(child, child_ctl);
                        children.insert(peer, child);
                        child
                    }
                };
                owner.send((NewDatagramMsg {
                    source: hdl,
                    handle: child,
                    buf: buf[..n].to_vec().into(),
                },));
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                ctl.credit.refund();
                continue;
            }
            Err(_) => {
                if !ctl.shutdown.swap(true, Ordering::AcqRel) {
                    owner.send((DatagramClosedMsg { handle: hdl },));
                }
                break;
            }
        }
    }
    core.datagrams.lock().remove(&hdl);
    for (_, child) in children {
        core.datagrams.lock().remove(&child);
    }
}

/// Reader for a connected (remote) datagram socket.
fn udp_remote_loop(
    core: Arc<Core>,
    ctl: Arc<DatagramCtl>,
    socket: UdpSocket,
    hdl: DatagramHandle,
    owner: ActorRef,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        if !ctl.credit.acquire(&ctl.shutdown) {
            break;
        }
        match socket.recv(&mut buf) {
            Ok(n) => {
                owner.send((NewDatagramMsg {
                    source: hdl,
                    handle: hdl,
                    buf: buf[..n].to_vec().into(),
                },));
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                ctl.credit.refund();
                continue;
            }
            Err(_) => {
                if !ctl.shutdown.swap(true, Ordering::AcqRel) {
                    owner.send((DatagramClosedMsg { handle: hdl },));
                }
                break;
            }
        }
    }
    core.datagrams.lock().remove(&hdl);
}
