//! Node identity.
//!
//! A node is one runtime process in the network. Its identifier pairs the
//! OS process id with a fixed-width random host tag, giving a value that
//! is globally unique, cheap to copy, and totally ordered. The pair is
//! generated once per [`crate::system::ActorSystem`] and never changes.

use std::cmp::Ordering;
use std::fmt;

use rand::RngCore;

/// Width of the host tag in bytes.
pub const HOST_ID_SIZE: usize = 20;

/// Globally unique identifier for one runtime process.
///
/// Ordering is lexicographic over `(process_id, host)`, equality and
/// hashing cover both fields. The wire form is the big-endian process id
/// followed by the host bytes ([`NodeId::WIRE_SIZE`] bytes total).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    process_id: u32,
    host: [u8; HOST_ID_SIZE],
}

impl NodeId {
    /// Serialized size in bytes.
    pub const WIRE_SIZE: usize = 4 + HOST_ID_SIZE;

    pub fn new(process_id: u32, host: [u8; HOST_ID_SIZE]) -> NodeId {
        NodeId { process_id, host }
    }

    /// Generate the identity of the calling process: OS pid plus random
    /// host bytes. Two systems in the same process get distinct ids
    /// through the random tag.
    pub fn generate() -> NodeId {
        let mut host = [0u8; HOST_ID_SIZE];
        rand::rng().fill_bytes(&mut host);
        NodeId {
            process_id: std::process::id(),
            host,
        }
    }

    /// The all-zero id, the wire encoding of "no node" (e.g. an
    /// unknown handshake destination).
    pub fn zero() -> NodeId {
        NodeId {
            process_id: 0,
            host: [0u8; HOST_ID_SIZE],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.process_id == 0 && self.host.iter().all(|b| *b == 0)
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn host(&self) -> &[u8; HOST_ID_SIZE] {
        &self.host
    }

    /// Append the wire form: `[u32 process_id BE][20 host bytes]`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.process_id.to_be_bytes());
        out.extend_from_slice(&self.host);
    }

    /// Parse the wire form from the front of `buf`.
    ///
    /// Returns `None` if `buf` is shorter than [`NodeId::WIRE_SIZE`].
    pub fn read_from(buf: &[u8]) -> Option<(NodeId, &[u8])> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let process_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut host = [0u8; HOST_ID_SIZE];
        host.copy_from_slice(&buf[4..Self::WIRE_SIZE]);
        Some((NodeId { process_id, host }, &buf[Self::WIRE_SIZE..]))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &NodeId) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &NodeId) -> Ordering {
        self.process_id
            .cmp(&other.process_id)
            .then_with(|| self.host.cmp(&other.host))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short host prefix, enough to tell nodes apart in logs.
        for b in &self.host[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "#{}", self.process_id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert_eq!(a.process_id(), b.process_id());
    }

    #[test]
    fn test_wire_round_trip() {
        let id = NodeId::generate();
        let mut buf = Vec::new();
        id.write_to(&mut buf);
        assert_eq!(buf.len(), NodeId::WIRE_SIZE);
        let (parsed, rest) = NodeId::read_from(&buf).unwrap();
        assert_eq!(parsed, id);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_read_rejects_short_input() {
        assert!(NodeId::read_from(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_order_is_lexicographic() {
        let a = NodeId::new(1, [0u8; HOST_ID_SIZE]);
        let b = NodeId::new(1, [1u8; HOST_ID_SIZE]);
        let c = NodeId::new(2, [0u8; HOST_ID_SIZE]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_zero() {
        assert!(NodeId::zero().is_zero());
        assert!(!NodeId::generate().is_zero());
    }
}
