//! Error model: tagged error values and exit reasons.
//!
//! Runtime errors are a tagged value `(category, code, context)`. The
//! category selects a code table: [`SecCode`] for system errors,
//! [`ExitReason`] for actor exit reasons, or a free-form user category.
//! The optional context tuple carries extra detail (e.g. the offending
//! message) and travels with the error when it crosses node boundaries.
//!
//! ## Propagation
//!
//! - A handler returning `HandlerResult::Fail(e)` delivers `e` to the
//!   sender as the response of the current request; it does not
//!   terminate the actor.
//! - A request whose deadline fires completes with
//!   `SecCode::RequestTimeout`; a request whose receiver dies completes
//!   with `SecCode::RequestReceiverDown`.
//! - Exit reasons other than `Normal` cascade along links; `Kill`
//!   bypasses handlers entirely.

use std::fmt;

use crate::message::Message;

// ---------------------------------------------------------------------------
// SecCode -- system error codes
// ---------------------------------------------------------------------------

/// System error codes (`sec` category).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(u32)]
pub enum SecCode {
    #[error("unexpected message")]
    UnexpectedMessage = 1,
    #[error("invalid argument")]
    InvalidArgument = 2,
    #[error("invalid stream state")]
    InvalidStreamState = 3,
    #[error("invalid upstream")]
    InvalidUpstream = 4,
    #[error("invalid downstream")]
    InvalidDownstream = 5,
    #[error("end of stream")]
    EndOfStream = 6,
    #[error("cannot connect to node")]
    CannotConnectToNode = 7,
    #[error("cannot open port")]
    CannotOpenPort = 8,
    #[error("no actor published at port")]
    NoActorPublishedAtPort = 9,
    #[error("request timeout")]
    RequestTimeout = 10,
    #[error("request receiver down")]
    RequestReceiverDown = 11,
    #[error("unexpected end of input")]
    UnexpectedEof = 12,
    #[error("unexpected newline")]
    UnexpectedNewline = 13,
    #[error("unexpected character")]
    UnexpectedCharacter = 14,
    #[error("trailing character")]
    TrailingCharacter = 15,
    #[error("too many characters")]
    TooManyCharacters = 16,
    #[error("integer overflow")]
    IntegerOverflow = 17,
    #[error("integer underflow")]
    IntegerUnderflow = 18,
    #[error("exponent underflow")]
    ExponentUnderflow = 19,
    #[error("fractional timespan")]
    FractionalTimespan = 20,
    #[error("illegal escape sequence")]
    IllegalEscapeSequence = 21,
    #[error("unhandled exception")]
    UnhandledException = 22,
    #[error("remote link unreachable")]
    RemoteLinkUnreachable = 23,
    #[error("broken promise")]
    BrokenPromise = 24,
    #[error("malformed BASP message")]
    MalformedBaspMessage = 25,
    #[error("no route to node")]
    NoRouteToNode = 26,
}

impl SecCode {
    /// Decode a raw code, e.g. from the wire.
    pub fn from_code(code: u32) -> Option<SecCode> {
        use SecCode::*;
        let all = [
            UnexpectedMessage,
            InvalidArgument,
            InvalidStreamState,
            InvalidUpstream,
            InvalidDownstream,
            EndOfStream,
            CannotConnectToNode,
            CannotOpenPort,
            NoActorPublishedAtPort,
            RequestTimeout,
            RequestReceiverDown,
            UnexpectedEof,
            UnexpectedNewline,
            UnexpectedCharacter,
            TrailingCharacter,
            TooManyCharacters,
            IntegerOverflow,
            IntegerUnderflow,
            ExponentUnderflow,
            FractionalTimespan,
            IllegalEscapeSequence,
            UnhandledException,
            RemoteLinkUnreachable,
            BrokenPromise,
            MalformedBaspMessage,
            NoRouteToNode,
        ];
        all.into_iter().find(|c| *c as u32 == code)
    }
}

// ---------------------------------------------------------------------------
// ExitReason
// ---------------------------------------------------------------------------

/// First user-defined exit code. Codes below this value are reserved.
pub const FIRST_USER_EXIT_CODE: u32 = 256;

/// Why an actor terminated.
///
/// `Normal` is absorbed by linked peers; `Kill` terminates
/// unconditionally and bypasses the exit handler; all other reasons
/// cascade along links.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// Regular completion.
    Normal,
    /// Unconditional termination; never absorbed, never trapped.
    Kill,
    /// Clean user-initiated shutdown.
    UserShutdown,
    /// A handler raised an error the actor did not absorb.
    UnhandledException,
    /// The link partner lives on a node that became unreachable.
    RemoteLinkUnreachable,
    /// Application-defined reason, `code >= FIRST_USER_EXIT_CODE`.
    User(u32),
}

impl ExitReason {
    /// Numeric code for wire transfer.
    pub fn code(self) -> u32 {
        match self {
            ExitReason::Normal => 0,
            ExitReason::Kill => 1,
            ExitReason::UserShutdown => 2,
            ExitReason::UnhandledException => 3,
            ExitReason::RemoteLinkUnreachable => 4,
            ExitReason::User(code) => code,
        }
    }

    /// Decode a numeric code. Codes in the reserved gap 5..256 are
    /// rejected.
    pub fn from_code(code: u32) -> Option<ExitReason> {
        match code {
            0 => Some(ExitReason::Normal),
            1 => Some(ExitReason::Kill),
            2 => Some(ExitReason::UserShutdown),
            3 => Some(ExitReason::UnhandledException),
            4 => Some(ExitReason::RemoteLinkUnreachable),
            c if c >= FIRST_USER_EXIT_CODE => Some(ExitReason::User(c)),
            _ => None,
        }
    }

    /// Whether linked peers must co-terminate on this reason.
    pub fn cascades(self) -> bool {
        !matches!(self, ExitReason::Normal)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Kill => write!(f, "kill"),
            ExitReason::UserShutdown => write!(f, "user-shutdown"),
            ExitReason::UnhandledException => write!(f, "unhandled-exception"),
            ExitReason::RemoteLinkUnreachable => write!(f, "remote-link-unreachable"),
            ExitReason::User(code) => write!(f, "user-exit({})", code),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Code table selector for [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    /// System error codes ([`SecCode`]).
    Sec = 0,
    /// Exit reasons ([`ExitReason`]).
    Exit = 1,
    /// Application-defined codes.
    User = 2,
}

impl ErrorCategory {
    pub fn from_u8(value: u8) -> Option<ErrorCategory> {
        match value {
            0 => Some(ErrorCategory::Sec),
            1 => Some(ErrorCategory::Exit),
            2 => Some(ErrorCategory::User),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A tagged error value: category + code + optional context tuple.
///
/// Errors are a builtin message element type; an error element as the
/// sole payload of a response marks the response as failed.
#[derive(Clone, Debug, Default)]
pub struct Error {
    category_code: Option<(ErrorCategory, u32)>,
    context: Message,
}

impl Error {
    /// The "no error" value.
    pub fn none() -> Error {
        Error::default()
    }

    pub fn sec(code: SecCode) -> Error {
        Error {
            category_code: Some((ErrorCategory::Sec, code as u32)),
            context: Message::empty(),
        }
    }

    pub fn exit(reason: ExitReason) -> Error {
        Error {
            category_code: Some((ErrorCategory::Exit, reason.code())),
            context: Message::empty(),
        }
    }

    pub fn user(code: u32) -> Error {
        Error {
            category_code: Some((ErrorCategory::User, code)),
            context: Message::empty(),
        }
    }

    /// Rebuild from raw parts, e.g. after deserialization.
    pub fn from_parts(category: ErrorCategory, code: u32, context: Message) -> Error {
        Error {
            category_code: Some((category, code)),
            context,
        }
    }

    /// Attach a context tuple.
    pub fn with_context(mut self, context: Message) -> Error {
        self.context = context;
        self
    }

    pub fn is_none(&self) -> bool {
        self.category_code.is_none()
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        self.category_code.map(|(c, _)| c)
    }

    pub fn code(&self) -> u32 {
        self.category_code.map(|(_, c)| c).unwrap_or(0)
    }

    pub fn context(&self) -> &Message {
        &self.context
    }

    /// The system error code, if this is a `sec` error.
    pub fn as_sec(&self) -> Option<SecCode> {
        match self.category_code {
            Some((ErrorCategory::Sec, code)) => SecCode::from_code(code),
            _ => None,
        }
    }

    /// The exit reason, if this is an `exit` error.
    pub fn as_exit(&self) -> Option<ExitReason> {
        match self.category_code {
            Some((ErrorCategory::Exit, code)) => ExitReason::from_code(code),
            _ => None,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.category_code == other.category_code && self.context == other.context
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category_code {
            None => write!(f, "none"),
            Some((ErrorCategory::Sec, code)) => match SecCode::from_code(code) {
                Some(sec) => write!(f, "sec::{}", sec),
                None => write!(f, "sec::<{}>", code),
            },
            Some((ErrorCategory::Exit, code)) => match ExitReason::from_code(code) {
                Some(reason) => write!(f, "exit::{}", reason),
                None => write!(f, "exit::<{}>", code),
            },
            Some((ErrorCategory::User, code)) => write!(f, "user::{}", code),
        }
    }
}

impl std::error::Error for Error {}

impl From<SecCode> for Error {
    fn from(code: SecCode) -> Error {
        Error::sec(code)
    }
}

impl From<ExitReason> for Error {
    fn from(reason: ExitReason) -> Error {
        Error::exit(reason)
    }
}

// ---------------------------------------------------------------------------
// InvalidAtom
// ---------------------------------------------------------------------------

/// Parse failure for [`crate::atom::Atom`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidAtom {
    #[error("atom text {0:?} exceeds 10 characters")]
    TooLong(String),
    #[error("atom text {0:?} contains invalid character {1:?}")]
    BadCharacter(String, char),
    #[error("raw value {0:#x} does not decode to an atom")]
    BadValue(u64),
}

impl From<InvalidAtom> for Error {
    fn from(_: InvalidAtom) -> Error {
        Error::sec(SecCode::InvalidArgument)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sec_code_round_trip() {
        for code in 1..=26 {
            let sec = SecCode::from_code(code).expect("known code");
            assert_eq!(sec as u32, code);
        }
        assert!(SecCode::from_code(0).is_none());
        assert!(SecCode::from_code(999).is_none());
    }

    #[test]
    fn test_exit_reason_round_trip() {
        let reasons = [
            ExitReason::Normal,
            ExitReason::Kill,
            ExitReason::UserShutdown,
            ExitReason::UnhandledException,
            ExitReason::RemoteLinkUnreachable,
            ExitReason::User(300),
        ];
        for reason in reasons {
            assert_eq!(ExitReason::from_code(reason.code()), Some(reason));
        }
        // Reserved gap between builtin codes and the user range.
        assert_eq!(ExitReason::from_code(5), None);
        assert_eq!(ExitReason::from_code(255), None);
    }

    #[test]
    fn test_only_normal_is_absorbed() {
        assert!(!ExitReason::Normal.cascades());
        assert!(ExitReason::Kill.cascades());
        assert!(ExitReason::UserShutdown.cascades());
        assert!(ExitReason::User(400).cascades());
    }

    #[test]
    fn test_error_accessors() {
        let err = Error::sec(SecCode::RequestTimeout);
        assert_eq!(err.as_sec(), Some(SecCode::RequestTimeout));
        assert_eq!(err.as_exit(), None);
        assert!(!err.is_none());
        assert!(Error::none().is_none());
        assert_eq!(format!("{}", err), "sec::request timeout");
    }
}
