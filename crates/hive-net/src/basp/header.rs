//! BASP header encoding.
//!
//! Every BASP frame starts with a fixed 78-byte header, big-endian
//! throughout:
//!
//! ```text
//! offset  size  field
//!      0     1  operation
//!      1     1  flags
//!      2     4  payload length
//!      6     8  operation data
//!     14    24  source node id     (u32 process id + 20 host bytes)
//!     38    24  destination node id
//!     62     8  source actor id
//!     70     8  destination actor id
//! ```
//!
//! On datagram transports a 2-byte sequence number sits between
//! operation data and the source node id, growing the header to 80
//! bytes.

use hive_core::{ActorId, Error, NodeId, SecCode};

/// Protocol version, carried in the operation-data field of both
/// handshakes.
pub const VERSION: u64 = 1;

/// Fixed header size on stream transports.
pub const HEADER_SIZE: usize = 1 + 1 + 4 + 8 + NodeId::WIRE_SIZE * 2 + 8 + 8;

/// Header size on datagram transports (sequence number included).
pub const DATAGRAM_HEADER_SIZE: usize = HEADER_SIZE + 2;

/// Largest payload the receiving side accepts (64 MiB).
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Flag bits.
pub mod flags {
    /// The destination actor field holds an atom naming a registered
    /// actor on the receiving node.
    pub const NAMED_RECEIVER: u8 = 0x01;
    /// The source proxy may be re-bound after a transient disconnect.
    pub const REDEPLOYABLE: u8 = 0x02;

    pub const ALL: u8 = NAMED_RECEIVER | REDEPLOYABLE;
}

/// BASP operation codes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum Operation {
    /// Acceptor side of the handshake; operation data carries the
    /// version, the payload the optionally published actor.
    ServerHandshake = 0x00,
    /// Connector side of the handshake; operation data carries the
    /// version.
    ClientHandshake = 0x01,
    /// A user message; operation data carries the message id.
    DispatchMessage = 0x02,
    /// The sender created a proxy for (dest node, dest actor).
    AnnounceProxy = 0x03,
    /// (source node, source actor) terminated; payload carries the
    /// exit reason code.
    KillProxy = 0x04,
    /// Liveness probe, no payload.
    Heartbeat = 0x05,
}

impl Operation {
    pub fn from_u8(raw: u8) -> Option<Operation> {
        match raw {
            0x00 => Some(Operation::ServerHandshake),
            0x01 => Some(Operation::ClientHandshake),
            0x02 => Some(Operation::DispatchMessage),
            0x03 => Some(Operation::AnnounceProxy),
            0x04 => Some(Operation::KillProxy),
            0x05 => Some(Operation::Heartbeat),
            _ => None,
        }
    }
}

/// One parsed BASP frame header.
#[derive(Clone, PartialEq, Debug)]
pub struct Header {
    pub operation: Operation,
    pub flags: u8,
    pub payload_len: u32,
    pub operation_data: u64,
    pub source_node: NodeId,
    pub dest_node: NodeId,
    pub source_actor: ActorId,
    pub dest_actor: ActorId,
}

impl Header {
    pub fn new(operation: Operation) -> Header {
        Header {
            operation,
            flags: 0,
            payload_len: 0,
            operation_data: 0,
            source_node: NodeId::zero(),
            dest_node: NodeId::zero(),
            source_actor: 0,
            dest_actor: 0,
        }
    }

    pub fn client_handshake(source_node: NodeId) -> Header {
        Header {
            operation_data: VERSION,
            source_node,
            ..Header::new(Operation::ClientHandshake)
        }
    }

    pub fn server_handshake(source_node: NodeId, dest_node: NodeId) -> Header {
        Header {
            operation_data: VERSION,
            source_node,
            dest_node,
            ..Header::new(Operation::ServerHandshake)
        }
    }

    pub fn heartbeat(source_node: NodeId, dest_node: NodeId) -> Header {
        Header {
            source_node,
            dest_node,
            ..Header::new(Operation::Heartbeat)
        }
    }

    /// Append the stream wire form.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.operation as u8);
        out.push(self.flags);
        out.extend_from_slice(&self.payload_len.to_be_bytes());
        out.extend_from_slice(&self.operation_data.to_be_bytes());
        self.source_node.write_to(out);
        self.dest_node.write_to(out);
        out.extend_from_slice(&self.source_actor.to_be_bytes());
        out.extend_from_slice(&self.dest_actor.to_be_bytes());
    }

    /// Append the datagram wire form with its sequence number.
    pub fn write_to_datagram(&self, sequence: u16, out: &mut Vec<u8>) {
        out.push(self.operation as u8);
        out.push(self.flags);
        out.extend_from_slice(&self.payload_len.to_be_bytes());
        out.extend_from_slice(&self.operation_data.to_be_bytes());
        out.extend_from_slice(&sequence.to_be_bytes());
        self.source_node.write_to(out);
        self.dest_node.write_to(out);
        out.extend_from_slice(&self.source_actor.to_be_bytes());
        out.extend_from_slice(&self.dest_actor.to_be_bytes());
    }

    /// Parse the stream wire form from exactly [`HEADER_SIZE`] leading
    /// bytes.
    pub fn read_from(buf: &[u8]) -> Result<Header, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::sec(SecCode::UnexpectedEof));
        }
        let (fixed, rest) = parse_fixed(buf)?;
        let (header, _) = parse_tail(fixed, rest)?;
        Ok(header)
    }

    /// Parse the datagram wire form, returning the sequence number.
    pub fn read_from_datagram(buf: &[u8]) -> Result<(Header, u16), Error> {
        if buf.len() < DATAGRAM_HEADER_SIZE {
            return Err(Error::sec(SecCode::UnexpectedEof));
        }
        let (fixed, rest) = parse_fixed(buf)?;
        let sequence = u16::from_be_bytes([rest[0], rest[1]]);
        let (header, _) = parse_tail(fixed, &rest[2..])?;
        Ok((header, sequence))
    }

    /// Sanity checks shared by all inbound frames.
    pub fn validate(&self) -> Result<(), Error> {
        if self.payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::sec(SecCode::MalformedBaspMessage));
        }
        if self.flags & !flags::ALL != 0 {
            return Err(Error::sec(SecCode::MalformedBaspMessage));
        }
        if self.source_node.is_zero() {
            // Every operation identifies its origin.
            return Err(Error::sec(SecCode::MalformedBaspMessage));
        }
        Ok(())
    }
}

struct FixedFields {
    operation: Operation,
    flags: u8,
    payload_len: u32,
    operation_data: u64,
}

/// Parse the 14 leading bytes shared by both wire forms.
fn parse_fixed(buf: &[u8]) -> Result<(FixedFields, &[u8]), Error> {
    let operation =
        Operation::from_u8(buf[0]).ok_or(Error::sec(SecCode::MalformedBaspMessage))?;
    let flags = buf[1];
    let payload_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    let operation_data = u64::from_be_bytes([
        buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13],
    ]);
    Ok((
        FixedFields {
            operation,
            flags,
            payload_len,
            operation_data,
        },
        &buf[14..],
    ))
}

/// Parse node and actor ids following the fixed fields (and, on
/// datagram paths, the sequence number).
fn parse_tail<'a>(fixed: FixedFields, buf: &'a [u8]) -> Result<(Header, &'a [u8]), Error> {
    let (source_node, buf) =
        NodeId::read_from(buf).ok_or(Error::sec(SecCode::UnexpectedEof))?;
    let (dest_node, buf) = NodeId::read_from(buf).ok_or(Error::sec(SecCode::UnexpectedEof))?;
    if buf.len() < 16 {
        return Err(Error::sec(SecCode::UnexpectedEof));
    }
    let source_actor = u64::from_be_bytes(buf[0..8].try_into().expect("sized"));
    let dest_actor = u64::from_be_bytes(buf[8..16].try_into().expect("sized"));
    Ok((
        Header {
            operation: fixed.operation,
            flags: fixed.flags,
            payload_len: fixed.payload_len,
            operation_data: fixed.operation_data,
            source_node,
            dest_node,
            source_actor,
            dest_actor,
        },
        &buf[16..],
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
