//! Runtime type tokens and the user-type registry.
//!
//! Every message element carries a [`TypeToken`]: either one of the
//! builtin type numbers below, or number zero plus a registered type
//! name. Tokens drive handler matching (first-fit over the token
//! sequence) and tell the serializer how to encode an element.
//!
//! User-defined element types implement [`UserType`] and register a
//! deserializer factory in the system's [`TypeRegistry`] so inbound
//! network payloads can rebuild them by name.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::message::MessageValue;
use crate::serial::{Deserializer, Serializer};

// ---------------------------------------------------------------------------
// Builtin type numbers
// ---------------------------------------------------------------------------

/// Builtin type numbers. Zero is reserved for named user types.
pub mod type_nr {
    pub const USER: u16 = 0;
    pub const I8: u16 = 1;
    pub const U8: u16 = 2;
    pub const I16: u16 = 3;
    pub const U16: u16 = 4;
    pub const I32: u16 = 5;
    pub const U32: u16 = 6;
    pub const I64: u16 = 7;
    pub const U64: u16 = 8;
    pub const F32: u16 = 9;
    pub const F64: u16 = 10;
    pub const BOOL: u16 = 11;
    pub const STRING: u16 = 12;
    pub const ATOM: u16 = 13;
    pub const NODE_ID: u16 = 14;
    pub const ACTOR_ADDR: u16 = 15;
    pub const ERROR: u16 = 16;
    pub const DOWN_MSG: u16 = 17;
    pub const EXIT_MSG: u16 = 18;
    pub const TIMEOUT_MSG: u16 = 19;
    pub const TERMINATE_MSG: u16 = 20;

    /// Human-readable name of a builtin number (diagnostics only).
    pub fn name(nr: u16) -> &'static str {
        match nr {
            I8 => "i8",
            U8 => "u8",
            I16 => "i16",
            U16 => "u16",
            I32 => "i32",
            U32 => "u32",
            I64 => "i64",
            U64 => "u64",
            F32 => "f32",
            F64 => "f64",
            BOOL => "bool",
            STRING => "string",
            ATOM => "atom",
            NODE_ID => "node_id",
            ACTOR_ADDR => "actor_addr",
            ERROR => "error",
            DOWN_MSG => "down_msg",
            EXIT_MSG => "exit_msg",
            TIMEOUT_MSG => "timeout_msg",
            TERMINATE_MSG => "terminate_msg",
            _ => "?",
        }
    }
}

// ---------------------------------------------------------------------------
// TypeToken
// ---------------------------------------------------------------------------

/// Runtime type identity of a message element.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypeToken {
    nr: u16,
    name: Option<Arc<str>>,
}

impl TypeToken {
    pub fn builtin(nr: u16) -> TypeToken {
        debug_assert_ne!(nr, type_nr::USER);
        TypeToken { nr, name: None }
    }

    pub fn named(name: impl Into<Arc<str>>) -> TypeToken {
        TypeToken {
            nr: type_nr::USER,
            name: Some(name.into()),
        }
    }

    pub fn nr(&self) -> u16 {
        self.nr
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_user_type(&self) -> bool {
        self.nr == type_nr::USER
    }
}

impl std::fmt::Debug for TypeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", type_nr::name(self.nr)),
        }
    }
}

/// Compile-time token lookup, implemented by every element type.
pub trait StaticType {
    fn type_token() -> TypeToken;
}

// ---------------------------------------------------------------------------
// UserType
// ---------------------------------------------------------------------------

/// A named application-defined message element type.
///
/// Pair the impl with [`crate::user_message_type!`], which derives the
/// [`MessageValue`] and [`StaticType`] plumbing from it. Registering the
/// type in the [`TypeRegistry`] makes it transferable across nodes.
pub trait UserType: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    /// Registered type name; must be unique within a system.
    const NAME: &'static str;

    fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error>;

    fn deserialize(source: &mut dyn Deserializer) -> Result<Self, Error>;
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

type DeserializeFn = fn(&mut dyn Deserializer) -> Result<Box<dyn MessageValue>, Error>;

fn deserialize_thunk<T: UserType + MessageValue>(
    source: &mut dyn Deserializer,
) -> Result<Box<dyn MessageValue>, Error> {
    T::deserialize(source).map(|v| Box::new(v) as Box<dyn MessageValue>)
}

/// Name-indexed registry of user-type deserializers.
///
/// Owned by the actor system; reads vastly outnumber writes, hence the
/// reader-writer lock.
#[derive(Default)]
pub struct TypeRegistry {
    entries: RwLock<FxHashMap<Arc<str>, DeserializeFn>>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    /// Register `T` under `T::NAME`. Re-registering the same name is a
    /// no-op (idempotent).
    pub fn register<T: UserType + MessageValue>(&self) {
        self.entries
            .write()
            .entry(Arc::from(T::NAME))
            .or_insert(deserialize_thunk::<T>);
    }

    /// Look up the deserializer for a registered name.
    pub fn lookup(&self, name: &str) -> Option<DeserializeFn> {
        self.entries.read().get(name).copied()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_identity() {
        assert_eq!(
            TypeToken::builtin(type_nr::I64),
            TypeToken::builtin(type_nr::I64)
        );
        assert_ne!(
            TypeToken::builtin(type_nr::I64),
            TypeToken::builtin(type_nr::U64)
        );
        assert_eq!(TypeToken::named("point"), TypeToken::named("point"));
        assert_ne!(TypeToken::named("point"), TypeToken::builtin(type_nr::I64));
    }

    #[test]
    fn test_registry_lookup() {
        #[derive(Clone, PartialEq, Debug)]
        struct Probe(i64);

        impl UserType for Probe {
            const NAME: &'static str = "probe";

            fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
                sink.write_i64(self.0)
            }

            fn deserialize(source: &mut dyn Deserializer) -> Result<Self, Error> {
                source.read_i64().map(Probe)
            }
        }

        crate::user_message_type!(Probe);

        let registry = TypeRegistry::new();
        assert!(registry.lookup("probe").is_none());
        registry.register::<Probe>();
        assert!(registry.lookup("probe").is_some());
        // Idempotent.
        registry.register::<Probe>();
        assert!(registry.lookup("probe").is_some());
    }
}
