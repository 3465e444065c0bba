//! Receive-side reorder buffer. See [`ReorderHeap`].

use std::{cmp::Reverse, collections::BinaryHeap};

use ahash::AHashSet;

use crate::{packet::Packet, seq::Seq};

/// Wraps a [`Packet`] so it orders by [`Packet::cmp_by_seq`] inside a
/// [`BinaryHeap`] (which is a max-heap; see [`ReorderHeap`] for how this
/// is turned into a min-heap).
#[derive(Debug, Clone, PartialEq, Eq)]
struct BySeq(Packet);

impl PartialOrd for BySeq {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BySeq {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp_by_seq(&other.0)
    }
}

/// Min-heap of received-but-not-yet-deliverable packets, keyed on
/// [`Packet::sequence_number`].
///
/// Used by [`crate::connection::Connection`] to hold packets that arrived
/// ahead of `next_expected_seqnum`, until the gap is filled and they (or a
/// contiguous fragment group starting at them) can be delivered in order.
///
/// Maintains a side index of contained sequence numbers so membership tests
/// and duplicate rejection are `O(1)`, while `push`/`pop_min` stay `O(log n)`.
#[derive(Debug, Clone, Default)]
pub struct ReorderHeap {
    heap: BinaryHeap<Reverse<BySeq>>,
    seqnums: AHashSet<Seq>,
}

impl ReorderHeap {
    /// Creates a new, empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True if no packets are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// True if a packet with this sequence number is already buffered.
    #[must_use]
    pub fn contains(&self, seq: Seq) -> bool {
        self.seqnums.contains(&seq)
    }

    /// Pushes `packet` into the heap.
    ///
    /// Returns `false` without modifying the heap if a packet with the same
    /// sequence number is already present (the connection treats this as a
    /// silent duplicate); returns `true` on success.
    pub fn push(&mut self, packet: Packet) -> bool {
        if !self.seqnums.insert(packet.sequence_number) {
            return false;
        }
        self.heap.push(Reverse(BySeq(packet)));
        true
    }

    /// Returns a reference to the packet with the minimum sequence number,
    /// without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&Packet> {
        self.heap.peek().map(|Reverse(BySeq(p))| p)
    }

    /// Removes and returns the packet with the minimum sequence number.
    ///
    /// Returns `None` on an empty heap — deliberately an explicit result
    /// rather than an error or panic, since an empty heap is routine.
    pub fn pop_min(&mut self) -> Option<Packet> {
        let Reverse(BySeq(packet)) = self.heap.pop()?;
        self.seqnums.remove(&packet.sequence_number);
        Some(packet)
    }

    /// Attempts to pop a complete, contiguous fragment group starting at
    /// `seq`.
    ///
    /// Succeeds only if the heap's minimum sequence number equals `seq` *and*
    /// every sequence number in `[seq, seq + first.more_fragments]` is
    /// present. On success, those packets are removed and returned in
    /// ascending sequence order; on failure the heap is left untouched and
    /// `None` is returned.
    pub fn try_pop_fragment_group(&mut self, seq: Seq) -> Option<Vec<Packet>> {
        let min = self.peek()?;
        if min.sequence_number != seq {
            return None;
        }
        let group_len = u32::from(min.more_fragments) + 1;
        for i in 0..group_len {
            let member = seq.wrapping_add(u16::try_from(i).ok()?);
            if !self.seqnums.contains(&member) {
                return None;
            }
        }

        let mut group = Vec::with_capacity(group_len as usize);
        for _ in 0..group_len {
            group.push(self.pop_min().expect("checked membership above"));
        }
        Some(group)
    }
}
