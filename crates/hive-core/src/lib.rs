//! Hive actor runtime.
//!
//! Concurrent programs are collections of isolated actors exchanging
//! asynchronous messages. This crate is the local half of the runtime:
//! typed copy-on-write messages, two-band mailboxes, a work-stealing
//! scheduler (plus a deterministic test coordinator), behaviors with
//! first-fit dispatch and timeouts, request/response with futures and
//! promises, monitor/link failure propagation, local groups, and the
//! pluggable serializer consumed by the network layer (`hive-net`).
//!
//! ## Quick tour
//!
//! ```no_run
//! use hive_core::{ActorSystem, Atom, Behavior, HandlerResult, IntoMessage, SystemConfig};
//!
//! let system = ActorSystem::new(SystemConfig::default());
//! let echo = system.spawn(|_ctx| {
//!     Behavior::new().on::<(Atom, i64), _>(|_ctx, msg| {
//!         HandlerResult::Reply(msg.clone())
//!     })
//! });
//! echo.send((Atom::new("hello"), 1i64));
//! ```

pub mod actor;
pub mod atom;
pub mod behavior;
pub mod config;
pub mod envelope;
pub mod error;
pub mod group;
pub mod mailbox;
pub mod message;
pub mod mid;
pub mod node;
pub mod registry;
pub mod request;
pub mod sched;
pub mod serial;
pub mod sysmsg;
pub mod system;
pub mod types;

pub use actor::{ActorAddr, ActorCell, ActorId, ActorRef, Context, ResumeResult, ScopedActor};
pub use atom::Atom;
pub use behavior::{Behavior, DefaultHandler, HandlerResult, MessagePattern};
pub use config::{SchedulerPolicy, SystemConfig};
pub use envelope::Envelope;
pub use error::{Error, ErrorCategory, ExitReason, SecCode};
pub use group::{Group, GroupModule};
pub use mailbox::{EnqueueResult, Mailbox};
pub use message::{IntoMessage, Message, MessageValue};
pub use mid::{MessageId, MessagePriority};
pub use node::NodeId;
pub use registry::Registry;
pub use request::{RequestHandle, ResponsePromise};
pub use serial::{BinaryDeserializer, BinarySerializer, Deserializer, Serializer};
pub use sysmsg::{DownMsg, ExitMsg};
pub use system::{ActorSystem, SpawnOptions, TestProbe};
pub use types::{type_nr, StaticType, TypeRegistry, TypeToken, UserType};
