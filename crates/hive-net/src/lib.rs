//! Hive network layer: transparent distribution for `hive-core`.
//!
//! Extends local message passing across nodes with the Binary Actor
//! System Protocol (BASP): proxies stand in for remote actors, a
//! per-node broker drives the protocol instance over abstract
//! multiplexer endpoints, and the [`middleman::Middleman`] facade
//! publishes actors and connects to peers.
//!
//! ## Quick tour
//!
//! ```no_run
//! use hive_core::{ActorSystem, SystemConfig};
//! use hive_net::{DefaultMultiplexer, Middleman};
//!
//! // Earth publishes an actor...
//! let earth = ActorSystem::new(SystemConfig::default());
//! let earth_mm = Middleman::new(&earth, DefaultMultiplexer::new());
//! # let pong = earth.spawn(|_| hive_core::Behavior::new());
//! let port = earth_mm.publish(&pong, 0, false).unwrap();
//!
//! // ...and Mars talks to it through a proxy.
//! let mars = ActorSystem::new(SystemConfig::default());
//! let mars_mm = Middleman::new(&mars, DefaultMultiplexer::new());
//! let remote_pong = mars_mm.remote_actor("127.0.0.1", port).unwrap();
//! remote_pong.send((hive_core::Atom::new("ping"), 1i64));
//! ```

pub mod basp;
pub mod basp_broker;
pub mod broker;
pub mod middleman;
pub mod mpx;
pub mod proxy;

pub use basp::{Header, Instance, InstanceCallee, Operation, RoutingTable, VERSION};
pub use basp_broker::BaspConfig;
pub use broker::{
    AcceptorClosedMsg, Broker, ByteBuf, ConnectionClosedMsg, DataTransferredMsg,
    DatagramClosedMsg, DatagramSentMsg, NewConnectionMsg, NewDataMsg, NewDatagramMsg,
};
pub use middleman::Middleman;
pub use mpx::{
    AcceptorHandle, ConnectionHandle, DatagramHandle, DefaultMultiplexer, Multiplexer,
    MultiplexerPtr, TestMultiplexer, TestNetwork,
};
pub use proxy::{DispatchCmd, ProxyRegistry};
