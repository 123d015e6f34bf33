//! BASP: the Binary Actor System Protocol.
//!
//! Extends local message passing across nodes. [`header`] defines the
//! frame layout, [`routing`] the direct/indirect path table,
//! [`ordering`] the datagram sequencing, and [`instance`] the protocol
//! state machine tying them together inside the BASP broker.

pub mod header;
pub mod instance;
pub mod ordering;
pub mod routing;

pub use header::{flags, Header, Operation, DATAGRAM_HEADER_SIZE, HEADER_SIZE, VERSION};
pub use instance::{Instance, InstanceCallee};
pub use ordering::{Arrival, OrderedDelivery, SequenceCounter};
pub use routing::{EndpointHandle, ErasedRoutes, Route, RoutingTable};
