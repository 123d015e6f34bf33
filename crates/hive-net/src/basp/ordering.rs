//! Sequence-number ordering for datagram paths.
//!
//! Datagrams may arrive reordered; each outgoing frame carries a
//! 16-bit sequence number and the receiving side restores FIFO within
//! a finite window. Frames ahead of the expected counter wait in a
//! reorder buffer; a pending-delivery timeout flushes the buffer past
//! gaps so one lost datagram cannot stall the path forever.
//!
//! All counter arithmetic wraps modulo 2^16.

use std::collections::BTreeMap;

/// Monotonic outgoing counter, one per directed datagram path.
#[derive(Default, Debug)]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    pub fn new() -> SequenceCounter {
        SequenceCounter::default()
    }

    /// The sequence number for the next outgoing frame.
    pub fn next(&mut self) -> u16 {
        let seq = self.0;
        self.0 = self.0.wrapping_add(1);
        seq
    }
}

/// Verdict for one arrived frame.
#[derive(Debug, PartialEq)]
pub enum Arrival {
    /// These frames are ready, in sequence order (the arrived frame
    /// plus any buffered successors it released).
    Deliver(Vec<(u16, Vec<u8>)>),
    /// Ahead of the expected counter; parked in the reorder buffer.
    Buffered,
    /// Duplicate, stale, or out of window under the drop policy.
    Dropped,
}

/// Receiving-side reorder state for one datagram path.
pub struct OrderedDelivery {
    expected: u16,
    window: u16,
    /// Deliver out-of-window frames on arrival instead of dropping
    /// them.
    deliver_unordered: bool,
    /// Buffered frames keyed by their distance-ordered sequence
    /// number.
    pending: BTreeMap<u16, Vec<u8>>,
}

impl OrderedDelivery {
    pub fn new(window: u16, deliver_unordered: bool) -> OrderedDelivery {
        OrderedDelivery {
            expected: 0,
            window,
            deliver_unordered,
            pending: BTreeMap::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn expected(&self) -> u16 {
        self.expected
    }

    /// Process one arrived frame.
    pub fn arrived(&mut self, seq: u16, frame: Vec<u8>) -> Arrival {
        let distance = seq.wrapping_sub(self.expected);
        if distance == 0 {
            let mut ready = vec![(seq, frame)];
            self.expected = self.expected.wrapping_add(1);
            // Drain buffered successors.
            while let Some(frame) = self.pending.remove(&self.expected) {
                ready.push((self.expected, frame));
                self.expected = self.expected.wrapping_add(1);
            }
            return Arrival::Deliver(ready);
        }
        if distance <= self.window {
            // Ahead but within the window; duplicate buffering keeps
            // the first copy.
            self.pending.entry(seq).or_insert(frame);
            return Arrival::Buffered;
        }
        if distance >= 0x8000 {
            // Behind the expected counter: late duplicate.
            tracing::trace!(seq, expected = self.expected, "dropping stale datagram");
            return Arrival::Dropped;
        }
        if self.deliver_unordered {
            return Arrival::Deliver(vec![(seq, frame)]);
        }
        tracing::debug!(
            seq,
            expected = self.expected,
            window = self.window,
            "dropping out-of-window datagram"
        );
        Arrival::Dropped
    }

    /// Pending-delivery timeout: hand out every buffered frame in
    /// sequence order, skipping gaps, and advance the expected counter
    /// past the last one.
    pub fn flush(&mut self) -> Vec<(u16, Vec<u8>)> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        // Order by distance from `expected` so wrap-around buffers
        // flush correctly.
        let mut frames: Vec<(u16, Vec<u8>)> = std::mem::take(&mut self.pending)
            .into_iter()
            .collect();
        frames.sort_by_key(|(seq, _)| seq.wrapping_sub(self.expected));
        let first = frames.first().map(|(seq, _)| *seq).unwrap_or(self.expected);
        if first != self.expected {
            tracing::debug!(
                from = self.expected,
                to = first.wrapping_sub(1),
                "skipping missing datagram sequence numbers"
            );
        }
        let last = frames.last().map(|(seq, _)| *seq).unwrap_or(self.expected);
        self.expected = last.wrapping_add(1);
        frames
    }
}

impl std::fmt::Debug for OrderedDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedDelivery")
            .field("expected", &self.expected)
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
