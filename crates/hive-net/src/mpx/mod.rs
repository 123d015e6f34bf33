//! The multiplexer abstraction: transport endpoints behind opaque
//! handles.
//!
//! Brokers own endpoints, never sockets. The multiplexer hands out
//! handles for stream connections (scribes), accept sockets (doormen)
//! and datagram endpoints, and delivers transport activity into the
//! owning broker's mailbox as the ordinary messages defined in
//! [`crate::broker`].
//!
//! Two implementations ship with the crate: [`default_mpx`]'s
//! thread-driven sockets for production use and [`testing`]'s fully
//! virtual network for deterministic tests.

pub mod default_mpx;
pub mod testing;

pub use default_mpx::DefaultMultiplexer;
pub use testing::{TestMultiplexer, TestNetwork};

use std::fmt;
use std::sync::Arc;

use hive_core::{ActorRef, Error};

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub fn from_u64(id: u64) -> $name {
                $name(id)
            }

            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type! {
    /// A stream connection endpoint.
    ConnectionHandle
}

handle_type! {
    /// An accept socket endpoint.
    AcceptorHandle
}

handle_type! {
    /// A datagram endpoint.
    DatagramHandle
}

/// Credit value meaning "never passivate".
pub const UNLIMITED_CREDIT: usize = usize::MAX;

/// Capability consumed by the network core: create endpoints, move
/// bytes, manage read credit.
///
/// Every endpoint has an owning broker; transport activity arrives in
/// the owner's mailbox as `NewConnectionMsg`, `NewDataMsg`,
/// `DataTransferredMsg`, `ConnectionClosedMsg`, `NewDatagramMsg`,
/// `DatagramSentMsg`, `AcceptorClosedMsg` and `DatagramClosedMsg`
/// elements. Freshly created endpoints start with unlimited credit.
pub trait Multiplexer: Send + Sync {
    /// Connect a stream endpoint to `host:port`.
    fn new_tcp_scribe(
        &self,
        host: &str,
        port: u16,
        owner: &ActorRef,
    ) -> Result<ConnectionHandle, Error>;

    /// Bind an accept socket. Returns the handle and the actually
    /// bound port (`port` 0 requests an ephemeral one). Accepted
    /// connections belong to the doorman's owner.
    fn new_tcp_doorman(
        &self,
        port: u16,
        reuse_addr: bool,
        owner: &ActorRef,
    ) -> Result<(AcceptorHandle, u16), Error>;

    /// Bind a local datagram endpoint.
    fn new_udp_endpoint_local(
        &self,
        port: u16,
        owner: &ActorRef,
    ) -> Result<(DatagramHandle, u16), Error>;

    /// Create a datagram endpoint bound to a remote peer.
    fn new_udp_endpoint_remote(
        &self,
        host: &str,
        port: u16,
        owner: &ActorRef,
    ) -> Result<DatagramHandle, Error>;

    /// Queue bytes on a stream endpoint.
    fn write(&self, hdl: ConnectionHandle, buf: Vec<u8>) -> Result<(), Error>;

    /// Send one datagram.
    fn write_datagram(&self, hdl: DatagramHandle, buf: Vec<u8>) -> Result<(), Error>;

    /// Grant `credit` further event deliveries, then passivate the
    /// endpoint until the next trigger. The sole backpressure
    /// primitive.
    fn trigger(&self, hdl: ConnectionHandle, credit: usize);

    /// Datagram variant of [`Multiplexer::trigger`].
    fn trigger_datagram(&self, hdl: DatagramHandle, credit: usize);

    fn close(&self, hdl: ConnectionHandle);

    fn close_acceptor(&self, hdl: AcceptorHandle);

    fn close_datagram(&self, hdl: DatagramHandle);

    /// Local address hint for published endpoints ("host" part of the
    /// connectivity information announced to peers).
    fn local_host(&self) -> String;
}

/// Shared multiplexer handle.
pub type MultiplexerPtr = Arc<dyn Multiplexer>;
