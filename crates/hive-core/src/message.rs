//! Immutable, copy-on-write message tuples.
//!
//! A [`Message`] is a heterogeneously typed tuple shared by reference
//! count. Elements are boxed [`MessageValue`]s: primitives, atoms,
//! strings, addresses, errors, or registered user types. Copies are
//! cheap (one atomic increment); mutation goes through
//! [`Message::get_mut`], which unshares the tuple first.
//!
//! Messages expose their runtime type sequence for handler matching and
//! serialize element-wise through the pluggable serializer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::atom::Atom;
use crate::error::{Error, ErrorCategory, SecCode};
use crate::node::NodeId;
use crate::serial::{Deserializer, Serializer};
use crate::types::{type_nr, StaticType, TypeRegistry, TypeToken};

// ---------------------------------------------------------------------------
// MessageValue
// ---------------------------------------------------------------------------

/// One element of a message tuple.
///
/// Implemented for the builtin element types below; application types
/// implement [`crate::types::UserType`] and invoke
/// [`crate::user_message_type!`].
pub trait MessageValue: Send + Sync + fmt::Debug {
    /// Runtime type of this element.
    fn token(&self) -> TypeToken;

    /// Structural equality against another element.
    fn eq_value(&self, other: &dyn MessageValue) -> bool;

    fn clone_value(&self) -> Box<dyn MessageValue>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Encode the element body (the caller writes the object framing).
    fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error>;
}

impl Clone for Box<dyn MessageValue> {
    fn clone(&self) -> Box<dyn MessageValue> {
        self.clone_value()
    }
}

impl PartialEq for Box<dyn MessageValue> {
    fn eq(&self, other: &Box<dyn MessageValue>) -> bool {
        self.eq_value(other.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Builtin element types
// ---------------------------------------------------------------------------

macro_rules! builtin_values {
    ($($ty:ty => $nr:expr, $write:ident, $read:ident;)*) => {
        $(
            impl StaticType for $ty {
                fn type_token() -> TypeToken {
                    TypeToken::builtin($nr)
                }
            }

            impl MessageValue for $ty {
                fn token(&self) -> TypeToken {
                    <$ty as StaticType>::type_token()
                }

                fn eq_value(&self, other: &dyn MessageValue) -> bool {
                    other
                        .as_any()
                        .downcast_ref::<$ty>()
                        .is_some_and(|v| v == self)
                }

                fn clone_value(&self) -> Box<dyn MessageValue> {
                    Box::new(*self)
                }

                fn as_any(&self) -> &dyn Any {
                    self
                }

                fn as_any_mut(&mut self) -> &mut dyn Any {
                    self
                }

                fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
                    sink.$write(*self)
                }
            }
        )*
    };
}

builtin_values! {
    i8  => type_nr::I8,  write_i8,  read_i8;
    u8  => type_nr::U8,  write_u8,  read_u8;
    i16 => type_nr::I16, write_i16, read_i16;
    u16 => type_nr::U16, write_u16, read_u16;
    i32 => type_nr::I32, write_i32, read_i32;
    u32 => type_nr::U32, write_u32, read_u32;
    i64 => type_nr::I64, write_i64, read_i64;
    u64 => type_nr::U64, write_u64, read_u64;
    f32 => type_nr::F32, write_f32, read_f32;
    f64 => type_nr::F64, write_f64, read_f64;
    bool => type_nr::BOOL, write_bool, read_bool;
}

impl StaticType for String {
    fn type_token() -> TypeToken {
        TypeToken::builtin(type_nr::STRING)
    }
}

impl MessageValue for String {
    fn token(&self) -> TypeToken {
        <String as StaticType>::type_token()
    }

    fn eq_value(&self, other: &dyn MessageValue) -> bool {
        other
            .as_any()
            .downcast_ref::<String>()
            .is_some_and(|v| v == self)
    }

    fn clone_value(&self) -> Box<dyn MessageValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        sink.write_str(self)
    }
}

impl StaticType for Atom {
    fn type_token() -> TypeToken {
        TypeToken::builtin(type_nr::ATOM)
    }
}

impl MessageValue for Atom {
    fn token(&self) -> TypeToken {
        <Atom as StaticType>::type_token()
    }

    fn eq_value(&self, other: &dyn MessageValue) -> bool {
        other
            .as_any()
            .downcast_ref::<Atom>()
            .is_some_and(|v| v == self)
    }

    fn clone_value(&self) -> Box<dyn MessageValue> {
        Box::new(*self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        sink.write_u64(self.as_u64())
    }
}

impl StaticType for NodeId {
    fn type_token() -> TypeToken {
        TypeToken::builtin(type_nr::NODE_ID)
    }
}

impl MessageValue for NodeId {
    fn token(&self) -> TypeToken {
        <NodeId as StaticType>::type_token()
    }

    fn eq_value(&self, other: &dyn MessageValue) -> bool {
        other
            .as_any()
            .downcast_ref::<NodeId>()
            .is_some_and(|v| v == self)
    }

    fn clone_value(&self) -> Box<dyn MessageValue> {
        Box::new(*self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(NodeId::WIRE_SIZE);
        self.write_to(&mut buf);
        sink.write_raw(&buf)
    }
}

impl StaticType for Error {
    fn type_token() -> TypeToken {
        TypeToken::builtin(type_nr::ERROR)
    }
}

impl MessageValue for Error {
    fn token(&self) -> TypeToken {
        <Error as StaticType>::type_token()
    }

    fn eq_value(&self, other: &dyn MessageValue) -> bool {
        other
            .as_any()
            .downcast_ref::<Error>()
            .is_some_and(|v| v == self)
    }

    fn clone_value(&self) -> Box<dyn MessageValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        match self.category() {
            None => sink.write_u8(u8::MAX),
            Some(category) => {
                sink.write_u8(category as u8)?;
                sink.write_u32(self.code())?;
                self.context().serialize(sink)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// user_message_type! -- plumbing for UserType implementors
// ---------------------------------------------------------------------------

/// Derive [`MessageValue`] and [`StaticType`] for a
/// [`crate::types::UserType`] implementor.
#[macro_export]
macro_rules! user_message_type {
    ($ty:ty) => {
        impl $crate::types::StaticType for $ty {
            fn type_token() -> $crate::types::TypeToken {
                $crate::types::TypeToken::named(<$ty as $crate::types::UserType>::NAME)
            }
        }

        impl $crate::message::MessageValue for $ty {
            fn token(&self) -> $crate::types::TypeToken {
                <$ty as $crate::types::StaticType>::type_token()
            }

            fn eq_value(&self, other: &dyn $crate::message::MessageValue) -> bool {
                other
                    .as_any()
                    .downcast_ref::<$ty>()
                    .is_some_and(|v| v == self)
            }

            fn clone_value(&self) -> Box<dyn $crate::message::MessageValue> {
                Box::new(self.clone())
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }

            fn serialize(
                &self,
                sink: &mut dyn $crate::serial::Serializer,
            ) -> Result<(), $crate::error::Error> {
                <$ty as $crate::types::UserType>::serialize(self, sink)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An immutable, copy-on-write tuple of typed elements.
#[derive(Clone, Default)]
pub struct Message {
    elements: Arc<Vec<Box<dyn MessageValue>>>,
}

impl Message {
    pub fn empty() -> Message {
        Message::default()
    }

    pub fn from_values(elements: Vec<Box<dyn MessageValue>>) -> Message {
        Message {
            elements: Arc::new(elements),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Runtime type of element `i`.
    pub fn token(&self, i: usize) -> TypeToken {
        self.elements[i].token()
    }

    /// Typed element access.
    pub fn get<T: 'static>(&self, i: usize) -> Option<&T> {
        self.elements
            .get(i)
            .and_then(|e| e.as_any().downcast_ref::<T>())
    }

    /// Mutable typed access; unshares the tuple when needed.
    pub fn get_mut<T: 'static>(&mut self, i: usize) -> Option<&mut T> {
        let elements = Arc::make_mut(&mut self.elements);
        elements
            .get_mut(i)
            .and_then(|e| e.as_any_mut().downcast_mut::<T>())
    }

    /// Whether the element types equal `signature`, position by
    /// position.
    pub fn matches(&self, signature: &[TypeToken]) -> bool {
        self.elements.len() == signature.len()
            && self
                .elements
                .iter()
                .zip(signature)
                .all(|(e, t)| e.token() == *t)
    }

    /// The full type sequence (allocates; prefer [`Message::matches`]
    /// on hot paths).
    pub fn signature(&self) -> Vec<TypeToken> {
        self.elements.iter().map(|e| e.token()).collect()
    }

    /// True when the message is a failed response: a single error
    /// element.
    pub fn is_error(&self) -> bool {
        self.len() == 1 && self.token(0) == TypeToken::builtin(type_nr::ERROR)
    }

    /// Encode as varint element count followed by framed elements.
    pub fn serialize(&self, sink: &mut dyn Serializer) -> Result<(), Error> {
        sink.begin_sequence(self.elements.len())?;
        for element in self.elements.iter() {
            sink.begin_object(&element.token())?;
            element.serialize(sink)?;
            sink.end_object()?;
        }
        sink.end_sequence()
    }

    /// Decode a message; named types resolve through `registry`.
    pub fn deserialize(
        source: &mut dyn Deserializer,
        registry: &TypeRegistry,
    ) -> Result<Message, Error> {
        let count = source.begin_sequence()?;
        let mut elements: Vec<Box<dyn MessageValue>> = Vec::with_capacity(count);
        for _ in 0..count {
            let token = source.begin_object()?;
            elements.push(deserialize_element(&token, source, registry)?);
            source.end_object()?;
        }
        source.end_sequence()?;
        Ok(Message::from_values(elements))
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Message) -> bool {
        self.elements.len() == other.elements.len()
            && self
                .elements
                .iter()
                .zip(other.elements.iter())
                .all(|(a, b)| a.eq_value(b.as_ref()))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("msg");
        for element in self.elements.iter() {
            tuple.field(element);
        }
        tuple.finish()
    }
}

/// Decode one element body for `token`.
fn deserialize_element(
    token: &TypeToken,
    source: &mut dyn Deserializer,
    registry: &TypeRegistry,
) -> Result<Box<dyn MessageValue>, Error> {
    if token.is_user_type() {
        let name = token.name().ok_or(Error::sec(SecCode::InvalidArgument))?;
        let deserialize = registry
            .lookup(name)
            .ok_or_else(|| Error::sec(SecCode::InvalidArgument))?;
        return deserialize(source);
    }
    let value: Box<dyn MessageValue> = match token.nr() {
        type_nr::I8 => Box::new(source.read_i8()?),
        type_nr::U8 => Box::new(source.read_u8()?),
        type_nr::I16 => Box::new(source.read_i16()?),
        type_nr::U16 => Box::new(source.read_u16()?),
        type_nr::I32 => Box::new(source.read_i32()?),
        type_nr::U32 => Box::new(source.read_u32()?),
        type_nr::I64 => Box::new(source.read_i64()?),
        type_nr::U64 => Box::new(source.read_u64()?),
        type_nr::F32 => Box::new(source.read_f32()?),
        type_nr::F64 => Box::new(source.read_f64()?),
        type_nr::BOOL => Box::new(source.read_bool()?),
        type_nr::STRING => Box::new(source.read_str()?),
        type_nr::ATOM => {
            let raw = source.read_u64()?;
            Box::new(Atom::from_u64(raw).map_err(Error::from)?)
        }
        type_nr::NODE_ID => {
            let bytes = source.read_raw(NodeId::WIRE_SIZE)?;
            let (node, _) = NodeId::read_from(&bytes).ok_or(Error::sec(SecCode::UnexpectedEof))?;
            Box::new(node)
        }
        type_nr::ACTOR_ADDR => Box::new(crate::actor::ActorAddr::deserialize_body(source)?),
        type_nr::ERROR => Box::new(deserialize_error(source, registry)?),
        type_nr::DOWN_MSG => Box::new(crate::sysmsg::DownMsg::deserialize_body(source)?),
        type_nr::EXIT_MSG => Box::new(crate::sysmsg::ExitMsg::deserialize_body(source)?),
        _ => return Err(Error::sec(SecCode::MalformedBaspMessage)),
    };
    Ok(value)
}

fn deserialize_error(source: &mut dyn Deserializer, registry: &TypeRegistry) -> Result<Error, Error> {
    let raw_category = source.read_u8()?;
    if raw_category == u8::MAX {
        return Ok(Error::none());
    }
    let category = ErrorCategory::from_u8(raw_category)
        .ok_or(Error::sec(SecCode::MalformedBaspMessage))?;
    let code = source.read_u32()?;
    let context = Message::deserialize(source, registry)?;
    Ok(Error::from_parts(category, code, context))
}

// ---------------------------------------------------------------------------
// IntoMessage
// ---------------------------------------------------------------------------

/// Conversion of value tuples into messages.
pub trait IntoMessage {
    fn into_message(self) -> Message;
}

impl IntoMessage for Message {
    fn into_message(self) -> Message {
        self
    }
}

impl IntoMessage for () {
    fn into_message(self) -> Message {
        Message::empty()
    }
}

macro_rules! tuple_into_message {
    ($($name:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($name: MessageValue + 'static),+> IntoMessage for ($($name,)+) {
            fn into_message(self) -> Message {
                let ($($name,)+) = self;
                Message::from_values(vec![$(Box::new($name)),+])
            }
        }
    };
}

tuple_into_message!(A);
tuple_into_message!(A, B);
tuple_into_message!(A, B, C);
tuple_into_message!(A, B, C, D);
tuple_into_message!(A, B, C, D, E);
tuple_into_message!(A, B, C, D, E, F);
tuple_into_message!(A, B, C, D, E, F, G);
tuple_into_message!(A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{BinaryDeserializer, BinarySerializer};

    #[test]
    fn test_build_and_access() {
        let msg = (Atom::new("add"), 2i64, 3i64).into_message();
        assert_eq!(msg.len(), 3);
        assert_eq!(msg.get::<Atom>(0), Some(&Atom::new("add")));
        assert_eq!(msg.get::<i64>(1), Some(&2));
        assert_eq!(msg.get::<i64>(2), Some(&3));
        assert!(msg.get::<i64>(0).is_none());
        assert!(msg.get::<i64>(3).is_none());
    }

    #[test]
    fn test_matches_signature() {
        let msg = (Atom::new("put"), "key".to_string(), 1u64).into_message();
        assert!(msg.matches(&[
            TypeToken::builtin(type_nr::ATOM),
            TypeToken::builtin(type_nr::STRING),
            TypeToken::builtin(type_nr::U64),
        ]));
        assert!(!msg.matches(&[TypeToken::builtin(type_nr::ATOM)]));
    }

    #[test]
    fn test_structural_equality() {
        let a = (1i32, "x".to_string()).into_message();
        let b = (1i32, "x".to_string()).into_message();
        let c = (1i32, "y".to_string()).into_message();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, (1i64, "x".to_string()).into_message());
    }

    #[test]
    fn test_copies_share_storage() {
        let a = (42i64,).into_message();
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.elements, &b.elements));
    }

    #[test]
    fn test_serialize_round_trip() {
        let registry = TypeRegistry::new();
        let original = (
            Atom::new("mix"),
            -5i32,
            3.25f64,
            true,
            "text".to_string(),
            Error::sec(SecCode::RequestTimeout),
        )
            .into_message();

        let mut sink = BinarySerializer::new();
        original.serialize(&mut sink).unwrap();
        let bytes = sink.into_bytes();

        let mut source = BinaryDeserializer::new(&bytes);
        let restored = Message::deserialize(&mut source, &registry).unwrap();
        assert_eq!(restored, original);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_error_payload_detection() {
        let failed = (Error::sec(SecCode::RequestTimeout),).into_message();
        assert!(failed.is_error());
        assert!(!(1i64,).into_message().is_error());
        assert!(!Message::empty().is_error());
    }

    #[test]
    fn test_unknown_user_type_rejected() {
        let registry = TypeRegistry::new();
        let mut sink = BinarySerializer::new();
        sink.begin_sequence(1).unwrap();
        sink.begin_object(&TypeToken::named("ghost")).unwrap();
        sink.write_i64(1).unwrap();
        sink.end_object().unwrap();
        sink.end_sequence().unwrap();
        let bytes = sink.into_bytes();
        let mut source = BinaryDeserializer::new(&bytes);
        assert!(Message::deserialize(&mut source, &registry).is_err());
    }
}
