//! Actor control blocks, handles, and the handler-facing context.
//!
//! An actor is one control block ([`cell::ActorCell`]) owning a mailbox
//! and a stack of behaviors. Code holds actors through two handle
//! types: [`ActorRef`] (strong, keeps the actor alive) and
//! [`ActorAddr`] (weak identity, safe to embed in messages). The
//! [`Context`] is the API surface handlers see while running.

pub mod address;
pub mod blocking;
pub mod cell;
pub mod context;

pub use address::{ActorAddr, ActorRef};
pub use blocking::ScopedActor;
pub use cell::{ActorCell, ResumeResult};
pub use context::Context;

/// Actor identifier, unique within a node.
pub type ActorId = u64;

/// The reserved invalid actor id.
pub const INVALID_ACTOR_ID: ActorId = 0;
