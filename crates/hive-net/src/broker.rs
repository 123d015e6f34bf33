//! Brokers: actors that own transport endpoints.
//!
//! A broker receives transport activity as ordinary mailbox elements,
//! one of the event types below per activity, and reacts from its
//! behavior like any other actor. The [`Broker`] helper tracks which
//! endpoints an actor owns and releases them all on teardown.
//!
//! Flow control is credit-based: [`Broker::trigger`] grants an
//! endpoint N further event deliveries before it turns passive;
//! passive endpoints buffer activity until the next trigger.

use hive_core::user_message_type;
use hive_core::{ActorRef, Deserializer, Error, Serializer, TypeRegistry, UserType};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::mpx::{AcceptorHandle, ConnectionHandle, DatagramHandle, MultiplexerPtr};

// ---------------------------------------------------------------------------
// Transport event messages
// ---------------------------------------------------------------------------

macro_rules! event_type {
    ($(#[$doc:meta])* $name:ident, $wire_name:literal {
        $($field:ident: $ty:ty => $write:ident / $read:ident),* $(,)?
    }) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Debug)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl UserType for $name {
            const NAME: &'static str = $wire_name;

            fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
                $(sink.$write(self.$field.clone().into())?;)*
                Ok(())
            }

            fn deserialize(source: &mut dyn Deserializer) -> Result<Self, Error> {
                Ok($name {
                    $($field: source.$read()?.into(),)*
                })
            }
        }

        user_message_type!($name);
    };
}

impl From<u64> for ConnectionHandle {
    fn from(raw: u64) -> ConnectionHandle {
        ConnectionHandle(raw)
    }
}

impl From<ConnectionHandle> for u64 {
    fn from(hdl: ConnectionHandle) -> u64 {
        hdl.0
    }
}

impl From<u64> for AcceptorHandle {
    fn from(raw: u64) -> AcceptorHandle {
        AcceptorHandle(raw)
    }
}

impl From<AcceptorHandle> for u64 {
    fn from(hdl: AcceptorHandle) -> u64 {
        hdl.0
    }
}

impl From<u64> for DatagramHandle {
    fn from(raw: u64) -> DatagramHandle {
        DatagramHandle(raw)
    }
}

impl From<DatagramHandle> for u64 {
    fn from(hdl: DatagramHandle) -> u64 {
        hdl.0
    }
}

event_type! {
    /// A doorman accepted a connection.
    NewConnectionMsg, "hive.net.new_connection" {
        source: AcceptorHandle => write_u64 / read_u64,
        handle: ConnectionHandle => write_u64 / read_u64,
    }
}

event_type! {
    /// A stream endpoint received bytes.
    NewDataMsg, "hive.net.new_data" {
        handle: ConnectionHandle => write_u64 / read_u64,
        buf: ByteBuf => write_bytes_seq / read_bytes_seq,
    }
}

event_type! {
    /// A queued stream write completed.
    DataTransferredMsg, "hive.net.data_transferred" {
        handle: ConnectionHandle => write_u64 / read_u64,
        written: u64 => write_u64 / read_u64,
    }
}

event_type! {
    /// A stream endpoint closed (peer shutdown or transport error).
    ConnectionClosedMsg, "hive.net.connection_closed" {
        handle: ConnectionHandle => write_u64 / read_u64,
    }
}

event_type! {
    /// An accept socket closed.
    AcceptorClosedMsg, "hive.net.acceptor_closed" {
        handle: AcceptorHandle => write_u64 / read_u64,
    }
}

event_type! {
    /// A datagram endpoint received one datagram.
    NewDatagramMsg, "hive.net.new_datagram" {
        source: DatagramHandle => write_u64 / read_u64,
        handle: DatagramHandle => write_u64 / read_u64,
        buf: ByteBuf => write_bytes_seq / read_bytes_seq,
    }
}

event_type! {
    /// A queued datagram went out.
    DatagramSentMsg, "hive.net.datagram_sent" {
        handle: DatagramHandle => write_u64 / read_u64,
        written: u64 => write_u64 / read_u64,
    }
}

event_type! {
    /// A datagram endpoint closed.
    DatagramClosedMsg, "hive.net.datagram_closed" {
        handle: DatagramHandle => write_u64 / read_u64,
    }
}

/// Byte buffer payload of data events.
///
/// Wraps `Vec<u8>` so the event macro can serialize it as a
/// length-prefixed sequence.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ByteBuf(pub Vec<u8>);

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteBuf({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for ByteBuf {
    fn from(buf: Vec<u8>) -> ByteBuf {
        ByteBuf(buf)
    }
}

impl From<ByteBuf> for Vec<u8> {
    fn from(buf: ByteBuf) -> Vec<u8> {
        buf.0
    }
}

/// Serializer extensions used by the event macro.
trait SerializerExt {
    fn write_bytes_seq(&mut self, buf: ByteBuf) -> Result<(), Error>;
}

impl<'a> SerializerExt for dyn Serializer + 'a {
    fn write_bytes_seq(&mut self, buf: ByteBuf) -> Result<(), Error> {
        self.begin_sequence(buf.0.len())?;
        self.write_raw(&buf.0)?;
        self.end_sequence()
    }
}

trait DeserializerExt {
    fn read_bytes_seq(&mut self) -> Result<ByteBuf, Error>;
}

impl<'a> DeserializerExt for dyn Deserializer + 'a {
    fn read_bytes_seq(&mut self) -> Result<ByteBuf, Error> {
        let len = self.begin_sequence()?;
        let buf = self.read_raw(len)?;
        self.end_sequence()?;
        Ok(ByteBuf(buf))
    }
}

/// Register every transport event type with a system's type registry.
pub fn register_event_types(types: &TypeRegistry) {
    types.register::<NewConnectionMsg>();
    types.register::<NewDataMsg>();
    types.register::<DataTransferredMsg>();
    types.register::<ConnectionClosedMsg>();
    types.register::<AcceptorClosedMsg>();
    types.register::<NewDatagramMsg>();
    types.register::<DatagramSentMsg>();
    types.register::<DatagramClosedMsg>();
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Endpoint ownership bookkeeping for one broker actor.
pub struct Broker {
    mpx: MultiplexerPtr,
    scribes: FxHashSet<ConnectionHandle>,
    doormen: FxHashMap<AcceptorHandle, u16>,
    datagrams: FxHashSet<DatagramHandle>,
}

impl Broker {
    pub fn new(mpx: MultiplexerPtr) -> Broker {
        Broker {
            mpx,
            scribes: FxHashSet::default(),
            doormen: FxHashMap::default(),
            datagrams: FxHashSet::default(),
        }
    }

    pub fn mpx(&self) -> &MultiplexerPtr {
        &self.mpx
    }

    pub fn add_scribe(&mut self, hdl: ConnectionHandle) {
        self.scribes.insert(hdl);
    }

    pub fn add_datagram(&mut self, hdl: DatagramHandle) {
        self.datagrams.insert(hdl);
    }

    /// Connect a new scribe owned by `owner`.
    pub fn new_tcp_scribe(
        &mut self,
        host: &str,
        port: u16,
        owner: &ActorRef,
    ) -> Result<ConnectionHandle, Error> {
        let hdl = self.mpx.new_tcp_scribe(host, port, owner)?;
        self.scribes.insert(hdl);
        Ok(hdl)
    }

    /// Open a doorman owned by `owner`; returns handle and bound port.
    pub fn new_tcp_doorman(
        &mut self,
        port: u16,
        reuse_addr: bool,
        owner: &ActorRef,
    ) -> Result<(AcceptorHandle, u16), Error> {
        let (hdl, bound) = self.mpx.new_tcp_doorman(port, reuse_addr, owner)?;
        self.doormen.insert(hdl, bound);
        Ok((hdl, bound))
    }

    pub fn new_udp_endpoint_local(
        &mut self,
        port: u16,
        owner: &ActorRef,
    ) -> Result<(DatagramHandle, u16), Error> {
        let (hdl, bound) = self.mpx.new_udp_endpoint_local(port, owner)?;
        self.datagrams.insert(hdl);
        Ok((hdl, bound))
    }

    pub fn new_udp_endpoint_remote(
        &mut self,
        host: &str,
        port: u16,
        owner: &ActorRef,
    ) -> Result<DatagramHandle, Error> {
        let hdl = self.mpx.new_udp_endpoint_remote(host, port, owner)?;
        self.datagrams.insert(hdl);
        Ok(hdl)
    }

    pub fn write(&self, hdl: ConnectionHandle, buf: Vec<u8>) -> Result<(), Error> {
        self.mpx.write(hdl, buf)
    }

    pub fn write_datagram(&self, hdl: DatagramHandle, buf: Vec<u8>) -> Result<(), Error> {
        self.mpx.write_datagram(hdl, buf)
    }

    /// Grant read credit; see [`crate::mpx::Multiplexer::trigger`].
    pub fn trigger(&self, hdl: ConnectionHandle, credit: usize) {
        self.mpx.trigger(hdl, credit);
    }

    pub fn trigger_datagram(&self, hdl: DatagramHandle, credit: usize) {
        self.mpx.trigger_datagram(hdl, credit);
    }

    /// Drop one scribe.
    pub fn close(&mut self, hdl: ConnectionHandle) {
        if self.scribes.remove(&hdl) {
            self.mpx.close(hdl);
        }
    }

    /// Drop one doorman, returning its bound port.
    pub fn close_doorman(&mut self, hdl: AcceptorHandle) -> Option<u16> {
        let port = self.doormen.remove(&hdl);
        if port.is_some() {
            self.mpx.close_acceptor(hdl);
        }
        port
    }

    pub fn close_datagram(&mut self, hdl: DatagramHandle) {
        if self.datagrams.remove(&hdl) {
            self.mpx.close_datagram(hdl);
        }
    }

    /// Release every owned endpoint.
    pub fn close_all(&mut self) {
        for hdl in std::mem::take(&mut self.scribes) {
            self.mpx.close(hdl);
        }
        for (hdl, _) in std::mem::take(&mut self.doormen) {
            self.mpx.close_acceptor(hdl);
        }
        for hdl in std::mem::take(&mut self.datagrams) {
            self.mpx.close_datagram(hdl);
        }
    }

    /// Forget an endpoint the transport reported closed.
    pub fn forget(&mut self, hdl: ConnectionHandle) {
        self.scribes.remove(&hdl);
    }

    pub fn forget_datagram(&mut self, hdl: DatagramHandle) {
        self.datagrams.remove(&hdl);
    }

    pub fn forget_doorman(&mut self, hdl: AcceptorHandle) -> Option<u16> {
        self.doormen.remove(&hdl)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("scribes", &self.scribes.len())
            .field("doormen", &self.doormen.len())
            .field("datagrams", &self.datagrams.len())
            .finish()
    }
}
